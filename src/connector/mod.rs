//! Transport boundary for the controller serial link.
//!
//! A [`Connector`] moves one command line to the controller and returns the
//! raw reply line. It knows nothing about the command grammar or about
//! ordering; both live above it ([`crate::protocol`], [`crate::session`]).
//!
//! Two implementations: [`SerialConnector`] for real hardware (feature
//! `instrument_serial`) and [`MockConnector`] returning synthetic
//! acknowledgements for hardware-free operation and tests.

mod mock;
#[cfg(feature = "instrument_serial")]
mod serial;

pub use mock::{MockConnector, MockController, MockReply};
#[cfg(feature = "instrument_serial")]
pub use serial::SerialConnector;

use async_trait::async_trait;

/// Low-level transport for command lines.
#[async_trait]
pub trait Connector: Send {
    /// Short transport name for logs ("serial", "mock").
    fn name(&self) -> &str;

    /// Open the transport.
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Close the transport.
    async fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Send one command line and wait for the raw reply line.
    async fn send_raw(&mut self, line: &str) -> anyhow::Result<String>;

    /// Send one command line without waiting for a reply. Only used for
    /// commands the protocol defines as non-acknowledging.
    async fn send_raw_no_reply(&mut self, line: &str) -> anyhow::Result<()>;
}
