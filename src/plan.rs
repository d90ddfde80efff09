//! Declarative description of one acquisition run and the card-facing
//! values derived from it.
//!
//! An [`AcquisitionPlan`] is produced fully populated by configuration/UI
//! collaborators; the engine never infers missing fields. It is validated
//! once, before any hardware command is issued, and consumed read-only by
//! the programmer and the worker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::HardwareConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Pre-flight validation failure. Surfaced with zero side effects.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

/// Requested pacing between volumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Interval {
    /// Run volumes back to back at the hardware's maximum rate.
    AsFast,
    /// Start a volume every `ms` milliseconds (measured start to start).
    EveryMs(f64),
}

/// Laser/camera assignment for the active channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub label: String,
    /// Laser preset selected on the logic card for this channel.
    pub laser_preset: u8,
}

/// Trigger topology on the logic card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerTopology {
    /// Single-camera, factory preset only; no custom cells are written.
    SimplePreset,
    /// Two synchronized non-retriggerable one-shots (camera + laser gate).
    DualNrtPulses,
}

/// Immutable, validated description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    pub time_points: u32,
    pub slices_per_volume: u32,
    /// Inter-slice spacing, forwarded to sinks as the z voxel size.
    pub step_size_um: f64,
    pub exposure_ms: f64,
    /// Duration of the laser gate pulse per slice.
    pub laser_trig_duration_ms: f64,
    /// Extra settling delay before each side of a dual-path scan.
    pub delay_before_side_ms: f64,
    pub channel: ChannelSpec,
    pub interval: Interval,
    pub trigger: TriggerTopology,
    /// Base name the sink appends camera identifiers to.
    pub base_name: String,
}

impl AcquisitionPlan {
    /// Nominal duration of one volume, known before any hardware is touched.
    pub fn nominal_volume_duration_ms(&self) -> f64 {
        self.slices_per_volume as f64 * self.exposure_ms + self.delay_before_side_ms
    }

    /// Pre-flight validation. Must pass before the plan reaches hardware.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.slices_per_volume < 1 {
            return Err(PlanError::InvalidPlan("slice count must be >= 1".into()));
        }
        if self.time_points < 1 {
            return Err(PlanError::InvalidPlan("time point count must be >= 1".into()));
        }
        if self.exposure_ms.is_nan() || self.exposure_ms <= 0.0 {
            return Err(PlanError::InvalidPlan("exposure must be positive".into()));
        }
        if self.step_size_um.is_nan() || self.step_size_um <= 0.0 {
            return Err(PlanError::InvalidPlan(
                "slice step size must be positive".into(),
            ));
        }
        if self.laser_trig_duration_ms.is_nan() || self.laser_trig_duration_ms <= 0.0 {
            return Err(PlanError::InvalidPlan(
                "laser trigger duration must be positive".into(),
            ));
        }
        if self.delay_before_side_ms < 0.0 {
            return Err(PlanError::InvalidPlan(
                "delay before side must not be negative".into(),
            ));
        }
        if let Interval::EveryMs(ms) = self.interval {
            if !ms.is_finite() || ms < 0.0 {
                return Err(PlanError::InvalidPlan(format!(
                    "interval {}ms is not a valid duration",
                    ms
                )));
            }
            let floor = self.nominal_volume_duration_ms();
            if ms < floor {
                return Err(PlanError::InvalidPlan(format!(
                    "requested interval {:.1}ms is shorter than the minimum volume duration {:.1}ms",
                    ms, floor
                )));
            }
        }
        Ok(())
    }
}

/// Card-facing timing values, recomputed from the plan for every run and
/// never cached across plans.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingParameters {
    /// Sweep duration per slice.
    pub scan_duration_ms: f64,
    pub num_slices: u32,
    /// Hardware repeat count. Always 1: the worker paces time points in
    /// software so every volume is re-programmed and started explicitly.
    pub num_repeats: u32,
    pub delay_before_repeat_ms: f64,
    pub delay_before_side_ms: f64,
}

impl TimingParameters {
    pub fn derive(plan: &AcquisitionPlan) -> Self {
        Self {
            scan_duration_ms: plan.exposure_ms,
            num_slices: plan.slices_per_volume,
            num_repeats: 1,
            delay_before_repeat_ms: 0.0,
            delay_before_side_ms: plan.delay_before_side_ms,
        }
    }
}

/// Logic cell function codes, as understood by the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CellType {
    Gnd = 0,
    Vcc = 1,
    And = 2,
    Nand = 3,
    Or = 4,
    Nor = 5,
    Xor = 6,
    Xnor = 7,
    Inverter = 8,
    DFlipFlop = 9,
    RsFlipFlop = 10,
    DLatch = 11,
    Counter = 12,
    Delay = 13,
    /// Non-retriggerable one-shot.
    OneShotNrt = 14,
    Lut4Input = 15,
}

impl CellType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One addressable cell: type, configuration value, up to three inputs.
///
/// A cell's full quadruple must be written completely before the card is
/// armed, in the fixed field order type, config, inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicCell {
    /// Cell index on the card, 1..=16.
    pub index: u8,
    pub cell_type: CellType,
    pub config: u16,
    pub inputs: [u16; 3],
}

/// The custom cells to program for a run, held in ascending index order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogicProgram {
    cells: Vec<LogicCell>,
}

impl LogicProgram {
    /// No custom wiring; the programmer selects one fixed preset instead.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Build from arbitrary cells; sorts ascending and rejects duplicates
    /// or out-of-range indices.
    pub fn from_cells(mut cells: Vec<LogicCell>) -> Result<Self, PlanError> {
        cells.sort_by_key(|c| c.index);
        for pair in cells.windows(2) {
            if pair[0].index == pair[1].index {
                return Err(PlanError::InvalidPlan(format!(
                    "logic cell {} specified twice",
                    pair[0].index
                )));
            }
        }
        if let Some(cell) = cells.iter().find(|c| !(1..=16).contains(&c.index)) {
            return Err(PlanError::InvalidPlan(format!(
                "logic cell index {} outside 1..=16",
                cell.index
            )));
        }
        Ok(Self { cells })
    }

    /// Two synchronized non-retriggerable one-shots: one gating the camera
    /// trigger for the exposure, one gating the laser for the illumination
    /// window. Both are clocked off the card's pulse clock and fired by the
    /// scanner's per-slice TTL.
    pub fn dual_nrt_pulses(
        config: &HardwareConfig,
        exposure_ms: f64,
        laser_duration_ms: f64,
    ) -> Result<Self, PlanError> {
        let pulse = |duration_ms: f64| (duration_ms * config.pulses_per_ms).round() as u16;
        let inputs = [
            config.trigger_ttl_addr as u16,
            config.clock_addr as u16,
            0,
        ];
        Self::from_cells(vec![
            LogicCell {
                index: config.laser_cell,
                cell_type: CellType::OneShotNrt,
                config: pulse(laser_duration_ms),
                inputs,
            },
            LogicCell {
                index: config.camera_cell,
                cell_type: CellType::OneShotNrt,
                config: pulse(exposure_ms),
                inputs,
            },
        ])
    }

    /// Build the program matching a plan's trigger topology.
    pub fn for_plan(config: &HardwareConfig, plan: &AcquisitionPlan) -> Result<Self, PlanError> {
        match plan.trigger {
            TriggerTopology::SimplePreset => Ok(Self::passthrough()),
            TriggerTopology::DualNrtPulses => {
                Self::dual_nrt_pulses(config, plan.exposure_ms, plan.laser_trig_duration_ms)
            }
        }
    }

    pub fn cells(&self) -> &[LogicCell] {
        &self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// One expected image-producing instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionEvent {
    pub time_index: u32,
    pub slice_index: u32,
    pub channel: String,
    /// Physical camera expected to produce this image.
    pub camera_id: String,
}

/// Ordered event sequence for one volume: exactly `slices × cameras`
/// elements, slice-major, matching hardware production order.
pub fn volume_events(
    plan: &AcquisitionPlan,
    time_index: u32,
    camera_ids: &[String],
) -> Vec<AcquisitionEvent> {
    let mut events = Vec::with_capacity(plan.slices_per_volume as usize * camera_ids.len());
    for slice_index in 0..plan.slices_per_volume {
        for camera_id in camera_ids {
            events.push(AcquisitionEvent {
                time_index,
                slice_index,
                channel: plan.channel.label.clone(),
                camera_id: camera_id.clone(),
            });
        }
    }
    events
}

#[cfg(test)]
pub(crate) fn test_plan() -> AcquisitionPlan {
    AcquisitionPlan {
        time_points: 1,
        slices_per_volume: 10,
        step_size_um: 1.0,
        exposure_ms: 10.0,
        laser_trig_duration_ms: 10.0,
        delay_before_side_ms: 0.0,
        channel: ChannelSpec {
            label: "488nm".to_string(),
            laser_preset: 30,
        },
        interval: Interval::AsFast,
        trigger: TriggerTopology::SimplePreset,
        base_name: "run".to_string(),
    }
}
