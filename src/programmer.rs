//! Sequence programmer: compiles a plan's derived values into the exact
//! command ordering the controller cards require.
//!
//! The seven-step order in [`SequenceProgrammer::program_volume`] is the
//! single most safety-critical invariant of the engine. The cards track
//! commands with an internal state machine; mis-ordered or stale writes
//! silently desynchronize illumination, scanning, and exposure.
//!
//! The "start scan" command is deliberately not issued here; the worker
//! controls exactly when autonomous execution begins.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{HardwareConfig, LogicPresets};
use crate::plan::{LogicProgram, TimingParameters};
use crate::protocol::Command;
use crate::session::{DeviceSession, SessionError};

#[derive(Debug, Error)]
pub enum ProgramError {
    /// A command failed partway through the programming sequence. Resuming
    /// from a partial program is not safe; the run must fail.
    #[error("volume programming failed at '{step}': {source}")]
    PartiallyProgrammed {
        step: &'static str,
        source: SessionError,
    },

    /// The program was rejected before any command was issued.
    #[error("program rejected: {0}")]
    Rejected(String),
}

/// Which presets to select for a given logic program.
///
/// Encodes the collapse rule as data: with zero custom cells the whole
/// template/arm/route dance reduces to one fixed preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetPlan {
    /// Preset selected before any custom cells are written.
    pub select: u8,
    /// "Cell high" preset committing the programmed cells, if any.
    pub arm: Option<u8>,
    /// Final routing preset exposing the program to the trigger lines.
    pub route: Option<u8>,
}

impl PresetPlan {
    pub fn for_program(presets: &LogicPresets, program: &LogicProgram) -> Self {
        if program.is_empty() {
            Self {
                select: presets.simple,
                arm: None,
                route: None,
            }
        } else {
            Self {
                select: presets.template,
                arm: Some(presets.armed),
                route: Some(presets.routing),
            }
        }
    }
}

/// Translates timing parameters and logic programs into ordered command
/// batches against the [`DeviceSession`].
pub struct SequenceProgrammer {
    session: Arc<DeviceSession>,
    config: Arc<HardwareConfig>,
}

impl SequenceProgrammer {
    pub fn new(session: Arc<DeviceSession>, config: Arc<HardwareConfig>) -> Self {
        Self { session, config }
    }

    /// The single "go" command. Issued by the worker, never here.
    pub fn start_scan_command(&self) -> Command {
        Command::card(self.config.scanner_card, "SCAN")
    }

    /// Scanner run-state query; acknowledges with `1` while a scan runs.
    /// Used by the worker to reconcile an ambiguous start-scan timeout.
    pub fn scan_state_query(&self) -> Command {
        Command::card(self.config.scanner_card, "RS")
    }

    async fn step(&self, step: &'static str, command: Command) -> Result<(), ProgramError> {
        match self.session.send(&command).await {
            Ok(_) => Ok(()),
            Err(source) => {
                warn!(step, command = %command, %source, "programming step failed");
                self.best_effort_halt().await;
                Err(ProgramError::PartiallyProgrammed { step, source })
            }
        }
    }

    /// Pre-program the cards for one volume. All-or-nothing: on any failure
    /// a best-effort halt is issued and [`ProgramError::PartiallyProgrammed`]
    /// is returned.
    pub async fn program_volume(
        &self,
        timing: &TimingParameters,
        program: &LogicProgram,
    ) -> Result<(), ProgramError> {
        if timing.num_slices < 1 {
            return Err(ProgramError::Rejected("slice count must be >= 1".into()));
        }
        let scanner = self.config.scanner_card;
        let presets = PresetPlan::for_program(&self.config.presets, program);
        debug!(?timing, cells = program.cells().len(), "programming volume");

        // 1. Kill illumination before touching anything else; a half-written
        //    timing block must never fire the lasers.
        self.step(
            "disable illumination",
            Command::card(scanner, "LASER").param("X", 0u8),
        )
        .await?;

        // 2. Halt any in-progress motion on the scan axes.
        self.step("halt motion", Command::hub("\\")).await?;

        // 3. Scanner timing block. Each write is one acknowledged command.
        self.step(
            "repeat timing",
            Command::card(scanner, "NR")
                .param("X", timing.num_repeats)
                .param("Y", timing.delay_before_repeat_ms),
        )
        .await?;
        self.step(
            "slice count",
            Command::card(scanner, "NS").param("X", timing.num_slices),
        )
        .await?;
        self.step(
            "scan duration",
            Command::card(scanner, "NV").param("X", timing.scan_duration_ms),
        )
        .await?;
        self.step(
            "side delay",
            Command::card(scanner, "ND").param("X", timing.delay_before_side_ms),
        )
        .await?;

        // 4. Base topology preset (or the single fixed preset when there is
        //    nothing to wire).
        self.step("select preset", self.logic_preset(presets.select))
            .await?;

        // 5. Custom cells, ascending, each preceded by its pointer move and
        //    written in the fixed field order: type, config, inputs.
        for cell in program.cells() {
            self.step("cell pointer", Command::hub("M").param("E", cell.index))
                .await?;
            self.step(
                "cell type",
                Command::card(self.config.logic_card, "CCA").param("Y", cell.cell_type.code()),
            )
            .await?;
            self.step(
                "cell config",
                Command::card(self.config.logic_card, "CCA").param("Z", cell.config),
            )
            .await?;
            self.step(
                "cell inputs",
                Command::card(self.config.logic_card, "CCB")
                    .param("X", cell.inputs[0])
                    .param("Y", cell.inputs[1])
                    .param("Z", cell.inputs[2]),
            )
            .await?;
        }

        // 6. Commit the programmed cells.
        if let Some(armed) = presets.arm {
            self.step("arm logic", self.logic_preset(armed)).await?;
        }

        // 7. Expose the armed program to the camera trigger lines.
        if let Some(route) = presets.route {
            self.step("route triggers", self.logic_preset(route)).await?;
        }

        info!(
            slices = timing.num_slices,
            cells = program.cells().len(),
            "volume programmed"
        );
        Ok(())
    }

    fn logic_preset(&self, preset: u8) -> Command {
        Command::card(self.config.logic_card, "CCA").param("X", preset)
    }

    /// Select a laser preset on the logic card (channel selection).
    pub async fn select_laser_preset(&self, preset: u8) -> Result<(), SessionError> {
        self.session.send(&self.logic_preset(preset)).await?;
        Ok(())
    }

    /// Live/snap illumination on or off via the live/idle presets.
    pub async fn set_illumination(&self, on: bool) -> Result<(), SessionError> {
        let preset = if on {
            self.config.presets.live
        } else {
            self.config.presets.idle
        };
        info!(on, preset, "switching live illumination");
        self.session.send(&self.logic_preset(preset)).await?;
        Ok(())
    }

    /// Program the always-on cell and route it to the shutter connector.
    pub async fn open_global_shutter(&self) -> Result<(), SessionError> {
        let logic = self.config.logic_card;
        info!("opening global shutter");
        self.session
            .send(&Command::hub("M").param("E", self.config.always_on_cell))
            .await?;
        self.session
            .send(
                &Command::card(logic, "CCA")
                    .param("Y", crate::plan::CellType::Vcc.code()),
            )
            .await?;
        self.session
            .send(&Command::hub("M").param("E", self.config.shutter_output_addr))
            .await?;
        self.session
            .send(&Command::card(logic, "CCA").param("Z", self.config.always_on_cell))
            .await?;
        self.save_logic_settings().await
    }

    /// Route the shutter connector to ground.
    pub async fn close_global_shutter(&self) -> Result<(), SessionError> {
        info!("closing global shutter");
        self.session
            .send(&Command::hub("M").param("E", self.config.shutter_output_addr))
            .await?;
        self.session
            .send(&Command::card(self.config.logic_card, "CCA").param("Z", 0u8))
            .await?;
        self.save_logic_settings().await
    }

    /// Commit the logic card's programmed state to its nonvolatile settings.
    pub async fn save_logic_settings(&self) -> Result<(), SessionError> {
        self.session
            .send(&Command::card(self.config.logic_card, "SS").flag("Z"))
            .await?;
        Ok(())
    }

    /// Best-effort halt/reset: illumination off, motion halted. Fire and
    /// forget; used from failure and cancellation paths where a hung reply
    /// must not block cleanup.
    pub async fn best_effort_halt(&self) {
        let scanner = self.config.scanner_card;
        let off = Command::card(scanner, "LASER").param("X", 0u8);
        if let Err(e) = self.session.send_fire_and_forget(&off).await {
            warn!(%e, "best-effort illumination disable failed");
        }
        if let Err(e) = self.session.send_fire_and_forget(&Command::hub("\\")).await {
            warn!(%e, "best-effort halt failed");
        }
    }
}
