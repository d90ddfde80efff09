//! Hardware-timed acquisition sequencing for a light-sheet microscope.
//!
//! The controller's scanner and programmable logic cards are pre-programmed
//! over a serial link, then execute an entire Z-stack volume autonomously
//! while the engine drains frames from externally triggered cameras and
//! matches each one to the acquisition event it satisfies.
//!
//! Layering, bottom to top:
//! - [`protocol`]: pure codec for the `[address][mnemonic] KEY=value` grammar
//! - [`connector`]: serial/mock transports moving one line at a time
//! - [`session`]: single in-flight command, acknowledgement timeouts
//! - [`plan`]: validated run descriptions and derived card values
//! - [`programmer`]: the ordered programming sequence for one volume
//! - [`camera`] / [`sink`]: frame source and image consumer boundaries
//! - [`worker`]: the run task tying all of it together

pub mod camera;
pub mod config;
pub mod connector;
pub mod plan;
pub mod programmer;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod worker;

pub use camera::{FrameSource, SimulatedCameras};
pub use config::HardwareConfig;
pub use plan::{AcquisitionPlan, Interval, PlanError, TriggerTopology};
pub use programmer::SequenceProgrammer;
pub use session::{DeviceSession, SessionError};
pub use sink::{ImageSink, MemorySink};
pub use worker::{AcquisitionEngine, RunError, RunHandle, RunState};
