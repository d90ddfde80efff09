//! Acquisition worker: owns the run lifecycle from programming to the last
//! delivered frame.
//!
//! One run at a time. The engine spawns a task per run; the caller keeps a
//! [`RunHandle`] to observe state and request cancellation. Time points are
//! paced in software: every volume is re-programmed and started explicitly,
//! so a cancel or failure between volumes leaves the hardware idle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera::FrameSource;
use crate::config::HardwareConfig;
use crate::plan::{
    volume_events, AcquisitionEvent, AcquisitionPlan, Interval, LogicProgram, PlanError,
    TimingParameters,
};
use crate::programmer::SequenceProgrammer;
use crate::session::{DeviceSession, SessionError};
use crate::sink::{ImageSink, RunMetadata, RunOutcome, RunReport};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    InvalidPlan(#[from] PlanError),

    /// Only one run may be active. Fail-fast, never queued.
    #[error("an acquisition run is already active")]
    RunAlreadyActive,
}

/// Observable lifecycle of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    /// Writing timing and logic programs for the given time point.
    Programming { time_index: u32 },
    /// Cameras sequenced and waiting for the first hardware trigger.
    Armed { time_index: u32 },
    /// Scan started; the volume is executing on the hardware.
    Running {
        time_index: u32,
        events_completed: usize,
    },
    /// Popping frames for the current volume.
    Draining {
        time_index: u32,
        events_completed: usize,
    },
    Completed {
        events_completed: usize,
    },
    Cancelled {
        events_completed: usize,
    },
    Failed {
        events_completed: usize,
        reason: String,
    },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed { .. } | RunState::Cancelled { .. } | RunState::Failed { .. }
        )
    }
}

/// Cooperative cancellation: a flag the run re-checks at every safe point,
/// plus a notifier that interrupts the run's sleeps immediately.
#[derive(Clone, Default)]
struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep that returns early on cancellation. Callers re-check the flag.
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// Caller-side handle to a spawned run.
pub struct RunHandle {
    run_id: Uuid,
    state: watch::Receiver<RunState>,
    cancel: CancelToken,
    task: tokio::task::JoinHandle<()>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current state snapshot.
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Watch receiver for state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Request cancellation. Returns immediately; observe completion through
    /// the state channel or [`RunHandle::wait`]. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end and return its terminal state.
    pub async fn wait(self) -> RunState {
        let RunHandle { state, task, .. } = self;
        if let Err(e) = task.await {
            warn!(%e, "run task join failed");
        }
        let terminal = state.borrow().clone();
        terminal
    }
}

/// Entry point for hardware-timed acquisition runs.
pub struct AcquisitionEngine {
    session: Arc<DeviceSession>,
    config: Arc<HardwareConfig>,
    cameras: Arc<dyn FrameSource>,
    sink: Arc<dyn ImageSink>,
    active: Arc<AtomicBool>,
}

impl AcquisitionEngine {
    pub fn new(
        session: Arc<DeviceSession>,
        config: Arc<HardwareConfig>,
        cameras: Arc<dyn FrameSource>,
        sink: Arc<dyn ImageSink>,
    ) -> Self {
        Self {
            session,
            config,
            cameras,
            sink,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Validate the plan and spawn its run task.
    ///
    /// Fails with [`RunError::RunAlreadyActive`] while a previous run has not
    /// reached a terminal state.
    pub fn start(&self, plan: AcquisitionPlan) -> Result<RunHandle, RunError> {
        plan.validate()?;
        // Reserve the single run slot before spawning anything.
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::RunAlreadyActive);
        }

        let run_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let cancel = CancelToken::default();

        let task = RunTask {
            run_id,
            plan,
            config: Arc::clone(&self.config),
            programmer: SequenceProgrammer::new(
                Arc::clone(&self.session),
                Arc::clone(&self.config),
            ),
            session: Arc::clone(&self.session),
            cameras: Arc::clone(&self.cameras),
            sink: Arc::clone(&self.sink),
            cancel: cancel.clone(),
            state: state_tx,
            fifos: HashMap::new(),
            events_completed: 0,
        };
        let active = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            task.run().await;
            active.store(false, Ordering::SeqCst);
        });

        info!(%run_id, "acquisition run started");
        Ok(RunHandle {
            run_id,
            state: state_rx,
            cancel,
            task: handle,
        })
    }
}

/// How the volume loop ended, before cleanup.
enum LoopEnd {
    Completed,
    Cancelled,
    Failed(String),
}

struct RunTask {
    run_id: Uuid,
    plan: AcquisitionPlan,
    config: Arc<HardwareConfig>,
    programmer: SequenceProgrammer,
    session: Arc<DeviceSession>,
    cameras: Arc<dyn FrameSource>,
    sink: Arc<dyn ImageSink>,
    cancel: CancelToken,
    state: watch::Sender<RunState>,
    /// Outstanding events per camera, FIFO in hardware production order.
    fifos: HashMap<String, VecDeque<AcquisitionEvent>>,
    events_completed: usize,
}

impl RunTask {
    fn publish(&self, state: RunState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let camera_ids = match self.cameras.camera_ids().await {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => {
                self.finish(LoopEnd::Failed("no cameras resolved".into()), false)
                    .await;
                return;
            }
            Err(e) => {
                self.finish(LoopEnd::Failed(format!("camera resolution failed: {e}")), false)
                    .await;
                return;
            }
        };

        let metadata = RunMetadata {
            run_id: self.run_id,
            base_name: self.plan.base_name.clone(),
            camera_ids: camera_ids.clone(),
            time_points: self.plan.time_points,
            slices_per_volume: self.plan.slices_per_volume,
            step_size_um: self.plan.step_size_um,
            channel: self.plan.channel.label.clone(),
            started_at: Utc::now(),
        };
        if let Err(e) = self.sink.sequence_started(&metadata).await {
            self.finish(LoopEnd::Failed(format!("sink rejected run: {e}")), false)
                .await;
            return;
        }

        if let Err(e) = self.cameras.arm_external_trigger().await {
            self.finish(LoopEnd::Failed(format!("external trigger arming failed: {e}")), true)
                .await;
            return;
        }

        let end = self.volume_loop(&camera_ids).await;
        self.finish(end, true).await;
    }

    async fn volume_loop(&mut self, camera_ids: &[String]) -> LoopEnd {
        let timing = TimingParameters::derive(&self.plan);
        let program = match LogicProgram::for_plan(&self.config, &self.plan) {
            Ok(program) => program,
            Err(e) => return LoopEnd::Failed(e.to_string()),
        };
        let expected_per_volume = self.plan.slices_per_volume as usize * camera_ids.len();
        let interval = self.plan.interval;

        for time_index in 0..self.plan.time_points {
            if self.cancel.is_cancelled() {
                return LoopEnd::Cancelled;
            }
            let volume_start = Instant::now();

            self.publish(RunState::Programming { time_index });
            if let Err(e) = self.programmer.program_volume(&timing, &program).await {
                return LoopEnd::Failed(e.to_string());
            }

            if let Err(e) = self.cameras.start_sequence(expected_per_volume).await {
                return LoopEnd::Failed(format!("camera sequencing failed: {e}"));
            }
            self.publish(RunState::Armed { time_index });

            if let Err(reason) = self.start_scan().await {
                return LoopEnd::Failed(reason);
            }
            self.publish(RunState::Running {
                time_index,
                events_completed: self.events_completed,
            });

            match self.drain_volume(time_index, camera_ids).await {
                Ok(()) => {}
                Err(end) => return end,
            }
            if let Err(e) = self.cameras.stop_sequence().await {
                warn!(%e, "camera sequence stop failed after volume");
            }

            // Software pacing between volume starts; a late volume clamps
            // the wait to zero rather than erroring.
            if let Interval::EveryMs(ms) = interval {
                if time_index + 1 < self.plan.time_points {
                    let target = Duration::from_secs_f64(ms / 1_000.0);
                    let wait = target.saturating_sub(volume_start.elapsed());
                    if !wait.is_zero() {
                        self.cancel.sleep(wait).await;
                    }
                }
            }
        }
        LoopEnd::Completed
    }

    /// Issue the start-scan command. A timeout is ambiguous: the scanner may
    /// or may not have started. One state query resolves it.
    async fn start_scan(&self) -> Result<(), String> {
        match self.session.send(&self.programmer.start_scan_command()).await {
            Ok(_) => Ok(()),
            Err(SessionError::Timeout { command, timeout }) => {
                warn!(%command, ?timeout, "start-scan acknowledgement lost; querying scanner");
                match self.session.send(&self.programmer.scan_state_query()).await {
                    Ok(ack) if ack.first_int() == Some(1) => {
                        info!("scanner confirmed running despite lost acknowledgement");
                        Ok(())
                    }
                    Ok(_) => Err("start-scan unacknowledged and scanner idle".into()),
                    Err(e) => Err(format!("start-scan unacknowledged, state query failed: {e}")),
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Pop frames until every event of this volume is satisfied, the run is
    /// cancelled, or the volume deadline passes.
    async fn drain_volume(
        &mut self,
        time_index: u32,
        camera_ids: &[String],
    ) -> Result<(), LoopEnd> {
        self.fifos.clear();
        for camera_id in camera_ids {
            self.fifos.insert(camera_id.clone(), VecDeque::new());
        }
        let mut pending = 0usize;
        for event in volume_events(&self.plan, time_index, camera_ids) {
            // Key existence guaranteed by the loop above.
            if let Some(fifo) = self.fifos.get_mut(&event.camera_id) {
                fifo.push_back(event);
                pending += 1;
            }
        }
        let expected = pending;

        let deadline = Instant::now()
            + Duration::from_secs_f64(self.plan.nominal_volume_duration_ms() / 1_000.0)
            + self.config.timeouts.drain_grace();
        let poll = self.config.timeouts.poll_interval();
        self.publish(RunState::Draining {
            time_index,
            events_completed: self.events_completed,
        });

        while pending > 0 {
            while self.cameras.remaining().await > 0 {
                self.deliver_next().await.map_err(LoopEnd::Failed)?;
                pending -= 1;
                self.publish(RunState::Draining {
                    time_index,
                    events_completed: self.events_completed,
                });
                if pending == 0 {
                    return Ok(());
                }
            }
            if self.cancel.is_cancelled() {
                return Err(LoopEnd::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(LoopEnd::Failed(format!(
                    "volume {} incomplete: {} of {} frames missing at deadline",
                    time_index, pending, expected
                )));
            }
            self.cancel.sleep(poll).await;
        }
        Ok(())
    }

    /// Pop one frame, match it to its camera's oldest outstanding event, and
    /// hand it to the sink.
    async fn deliver_next(&mut self) -> Result<(), String> {
        let tagged = self
            .cameras
            .pop_frame()
            .await
            .map_err(|e| format!("frame pop failed: {e}"))?;
        let event = self
            .fifos
            .get_mut(&tagged.metadata.camera_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                format!(
                    "unexpected frame from camera '{}'",
                    tagged.metadata.camera_id
                )
            })?;
        debug!(
            camera = %event.camera_id,
            slice = event.slice_index,
            time = event.time_index,
            "frame matched"
        );
        self.sink
            .frame_ready(tagged.frame, &event, &tagged.metadata)
            .await
            .map_err(|e| format!("sink rejected frame: {e}"))?;
        self.events_completed += 1;
        Ok(())
    }

    /// Deliver frames the cameras already produced before the run ended.
    /// Best effort: matching or sink errors end the pass.
    async fn final_drain(&mut self) {
        while self.cameras.remaining().await > 0 {
            if let Err(e) = self.deliver_next().await {
                warn!(%e, "final drain stopped early");
                break;
            }
        }
    }

    async fn finish(mut self, end: LoopEnd, hardware_touched: bool) {
        let outcome = match &end {
            LoopEnd::Completed => RunOutcome::Completed,
            LoopEnd::Cancelled => RunOutcome::Cancelled,
            LoopEnd::Failed(reason) => RunOutcome::Failed {
                reason: reason.clone(),
            },
        };

        if hardware_touched {
            if !matches!(end, LoopEnd::Completed) {
                self.final_drain().await;
                self.programmer.best_effort_halt().await;
            }
            if let Err(e) = self.cameras.stop_sequence().await {
                warn!(%e, "camera sequence stop failed during teardown");
            }
            if let Err(e) = self.cameras.reset_internal_trigger().await {
                warn!(%e, "internal trigger restore failed during teardown");
            }
        }

        let report = RunReport {
            run_id: self.run_id,
            outcome: outcome.clone(),
            events_completed: self.events_completed,
            ended_at: Utc::now(),
        };
        if let Err(e) = self.sink.sequence_ended(&report).await {
            warn!(%e, "sink rejected run report");
        }

        let state = match outcome {
            RunOutcome::Completed => RunState::Completed {
                events_completed: self.events_completed,
            },
            RunOutcome::Cancelled => RunState::Cancelled {
                events_completed: self.events_completed,
            },
            RunOutcome::Failed { reason } => RunState::Failed {
                events_completed: self.events_completed,
                reason,
            },
        };
        info!(run_id = %self.run_id, ?state, "acquisition run ended");
        self.publish(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCameras;
    use crate::connector::{MockConnector, MockController, MockReply};
    use crate::plan::test_plan;
    use crate::session::SessionState;
    use crate::sink::MemorySink;

    struct Rig {
        engine: AcquisitionEngine,
        controller: MockController,
        sink: MemorySink,
        session: Arc<DeviceSession>,
    }

    async fn rig_with(cameras: SimulatedCameras, config: HardwareConfig) -> Rig {
        let connector = MockConnector::new();
        let controller = connector.controller();
        let config = Arc::new(config);
        let session = Arc::new(DeviceSession::new(
            Box::new(connector),
            config.timeouts.command_timeout(),
        ));
        session.connect().await.unwrap();
        let sink = MemorySink::new();
        let engine = AcquisitionEngine::new(
            Arc::clone(&session),
            config,
            Arc::new(cameras),
            Arc::new(sink.clone()),
        );
        Rig {
            engine,
            controller,
            sink,
            session,
        }
    }

    fn fast_config() -> HardwareConfig {
        HardwareConfig {
            timeouts: crate::config::TimeoutSettings {
                command_timeout_ms: 50,
                poll_interval_ms: 1,
                drain_grace_ms: 200,
            },
            ..HardwareConfig::default()
        }
    }

    #[tokio::test]
    async fn single_volume_run_completes_with_exact_command_log() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        let handle = rig.engine.start(test_plan()).unwrap();

        let state = handle.wait().await;
        assert_eq!(state, RunState::Completed { events_completed: 10 });

        // One programming pass plus the start command, nothing else.
        assert_eq!(
            rig.controller.sent(),
            vec![
                "3LASER X=0",
                "\\",
                "3NR X=1 Y=0",
                "3NS X=10",
                "3NV X=10",
                "3ND X=0",
                "6CCA X=5",
                "3SCAN",
            ]
        );

        let frames = rig.sink.frames();
        assert_eq!(frames.len(), 10);
        for (i, stored) in frames.iter().enumerate() {
            assert_eq!(stored.event.slice_index, i as u32);
            assert_eq!(stored.event.camera_id, "Camera-1");
        }
        assert_eq!(rig.sink.started().len(), 1);
        let ended = rig.sink.ended();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].outcome, RunOutcome::Completed);
        assert_eq!(ended[0].events_completed, 10);
    }

    #[tokio::test]
    async fn dual_camera_multi_timepoint_run() {
        let cameras = SimulatedCameras::new(
            "Dual-sCMOS",
            vec!["Camera-1".to_string(), "Camera-2".to_string()],
        );
        let rig = rig_with(cameras, fast_config()).await;
        let plan = AcquisitionPlan {
            time_points: 2,
            slices_per_volume: 5,
            ..test_plan()
        };
        let handle = rig.engine.start(plan).unwrap();
        let state = handle.wait().await;
        assert_eq!(state, RunState::Completed { events_completed: 20 });

        let started = rig.sink.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].camera_ids, vec!["Camera-1", "Camera-2"]);

        let frames = rig.sink.frames();
        assert_eq!(frames.len(), 20);
        // Each volume: slice-major with both cameras per slice.
        assert_eq!(frames[0].event.camera_id, "Camera-1");
        assert_eq!(frames[1].event.camera_id, "Camera-2");
        assert_eq!(frames[0].event.slice_index, frames[1].event.slice_index);
        assert!(frames[..10].iter().all(|f| f.event.time_index == 0));
        assert!(frames[10..].iter().all(|f| f.event.time_index == 1));
        assert_eq!(rig.sink.ended().len(), 1);
    }

    #[tokio::test]
    async fn second_start_fails_fast_while_active() {
        let cameras = SimulatedCameras::single("Camera-1");
        let camera_handle = cameras.handle();
        camera_handle.set_paced(true);
        let rig = rig_with(cameras, fast_config()).await;

        let handle = rig.engine.start(test_plan()).unwrap();
        assert!(rig.engine.is_active());
        assert!(matches!(
            rig.engine.start(test_plan()),
            Err(RunError::RunAlreadyActive)
        ));

        handle.cancel();
        let state = handle.wait().await;
        assert!(matches!(state, RunState::Cancelled { .. }));
        assert!(!rig.engine.is_active());

        // The slot is free again.
        camera_handle.set_paced(false);
        let second = rig.engine.start(test_plan()).unwrap();
        assert!(matches!(second.wait().await, RunState::Completed { .. }));
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_frames_and_frees_session() {
        let cameras = SimulatedCameras::single("Camera-1");
        let camera_handle = cameras.handle();
        camera_handle.set_paced(true);
        let rig = rig_with(cameras, fast_config()).await;

        let handle = rig.engine.start(test_plan()).unwrap();
        let mut states = handle.subscribe();
        // Wait until the run is draining, then let 4 frames through.
        while !matches!(&*states.borrow(), RunState::Draining { .. }) {
            states.changed().await.unwrap();
        }
        camera_handle.release(4);
        // Wait for all released frames to be delivered.
        loop {
            if let RunState::Draining { events_completed: 4, .. } = &*states.borrow() {
                break;
            }
            states.changed().await.unwrap();
        }

        handle.cancel();
        let state = handle.wait().await;
        assert_eq!(state, RunState::Cancelled { events_completed: 4 });

        assert_eq!(rig.sink.frames().len(), 4);
        let ended = rig.sink.ended();
        assert_eq!(ended[0].outcome, RunOutcome::Cancelled);
        assert_eq!(ended[0].events_completed, 4);
        // The session is idle and usable after cancellation.
        assert_eq!(rig.session.state(), SessionState::Connected);
        // The best-effort halt went out.
        let sent = rig.controller.sent();
        assert_eq!(&sent[sent.len() - 2..], &["3LASER X=0", "\\"]);
    }

    #[tokio::test]
    async fn skewed_arrival_across_cameras_keeps_per_camera_fifo() {
        let cameras = SimulatedCameras::new(
            "Dual-sCMOS",
            vec!["Camera-1".to_string(), "Camera-2".to_string()],
        );
        let camera_handle = cameras.handle();
        camera_handle.set_paced(true);
        let rig = rig_with(cameras, fast_config()).await;
        let plan = AcquisitionPlan {
            slices_per_volume: 4,
            ..test_plan()
        };

        let handle = rig.engine.start(plan).unwrap();
        let mut states = handle.subscribe();
        while !matches!(&*states.borrow(), RunState::Draining { .. }) {
            states.changed().await.unwrap();
        }
        // Every Camera-2 frame arrives before any Camera-1 frame.
        camera_handle.release_for("Camera-2", usize::MAX);
        camera_handle.release_for("Camera-1", usize::MAX);

        let state = handle.wait().await;
        assert_eq!(state, RunState::Completed { events_completed: 8 });

        // Each camera's frames still map to its own slices in ascending
        // order, regardless of cross-camera arrival skew.
        let frames = rig.sink.frames();
        assert_eq!(frames.len(), 8);
        for cam in ["Camera-1", "Camera-2"] {
            let slices: Vec<u32> = frames
                .iter()
                .filter(|f| f.event.camera_id == cam)
                .map(|f| f.event.slice_index)
                .collect();
            assert_eq!(slices, vec![0, 1, 2, 3]);
        }
        // Frames never carry the other camera's event.
        assert!(frames
            .iter()
            .all(|f| f.event.camera_id == f.metadata.camera_id));
    }

    #[tokio::test]
    async fn card_fault_during_programming_fails_the_run() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        rig.controller.stub("3NV", MockReply::Fault(-3));

        let handle = rig.engine.start(test_plan()).unwrap();
        let state = handle.wait().await;
        assert!(matches!(state, RunState::Failed { events_completed: 0, .. }));
        assert!(rig.sink.frames().is_empty());
        assert!(matches!(
            rig.sink.ended()[0].outcome,
            RunOutcome::Failed { .. }
        ));
        assert!(!rig.engine.is_active());
    }

    #[tokio::test]
    async fn lost_start_ack_reconciles_against_running_scanner() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        rig.controller.stub("3SCAN", MockReply::Hang);
        rig.controller.stub("3RS", MockReply::AckWith("1".into()));

        let handle = rig.engine.start(test_plan()).unwrap();
        let state = handle.wait().await;
        assert_eq!(state, RunState::Completed { events_completed: 10 });
    }

    #[tokio::test]
    async fn lost_start_ack_with_idle_scanner_fails() {
        let cameras = SimulatedCameras::single("Camera-1");
        cameras.handle().set_paced(true);
        let rig = rig_with(cameras, fast_config()).await;
        rig.controller.stub("3SCAN", MockReply::Hang);
        rig.controller.stub("3RS", MockReply::AckWith("0".into()));

        let handle = rig.engine.start(test_plan()).unwrap();
        let state = handle.wait().await;
        assert!(
            matches!(state, RunState::Failed { ref reason, .. } if reason.contains("scanner idle"))
        );
    }

    #[tokio::test]
    async fn missing_frames_fail_at_the_volume_deadline() {
        let cameras = SimulatedCameras::single("Camera-1");
        let camera_handle = cameras.handle();
        camera_handle.set_paced(true);
        let rig = rig_with(cameras, fast_config()).await;

        let handle = rig.engine.start(test_plan()).unwrap();
        let state = handle.wait().await;
        // Never Completed: the drain deadline turns missing frames into a
        // failure with the delivered count preserved.
        assert!(matches!(
            state,
            RunState::Failed { events_completed: 0, ref reason } if reason.contains("incomplete")
        ));
    }

    #[tokio::test]
    async fn sink_failure_fails_the_run() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        rig.sink.fail_on_frame(3);

        let handle = rig.engine.start(test_plan()).unwrap();
        let state = handle.wait().await;
        assert!(matches!(state, RunState::Failed { events_completed: 3, .. }));
    }

    #[tokio::test]
    async fn paced_interval_still_completes_all_volumes() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        let plan = AcquisitionPlan {
            time_points: 3,
            slices_per_volume: 2,
            exposure_ms: 1.0,
            interval: Interval::EveryMs(10.0),
            ..test_plan()
        };
        let handle = rig.engine.start(plan).unwrap();
        let started = Instant::now();
        let state = handle.wait().await;
        assert_eq!(state, RunState::Completed { events_completed: 6 });
        // Two inter-volume waits of up to 10 ms each.
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected_without_hardware_contact() {
        let rig = rig_with(SimulatedCameras::single("Camera-1"), fast_config()).await;
        let plan = AcquisitionPlan {
            slices_per_volume: 0,
            ..test_plan()
        };
        assert!(matches!(
            rig.engine.start(plan),
            Err(RunError::InvalidPlan(_))
        ));
        assert_eq!(rig.controller.sent_count(), 0);
        assert!(!rig.engine.is_active());
    }
}
