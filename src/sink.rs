//! Image sink boundary.
//!
//! The worker hands every matched frame to exactly one [`ImageSink`] together
//! with the event it satisfied. Storage format, directory layout, and viewer
//! notification all live behind this trait; the engine only guarantees the
//! delivery contract (one `sequence_started`/`sequence_ended` pair per run,
//! every delivered frame between them).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::camera::{Frame, FrameMetadata};
use crate::plan::AcquisitionEvent;

/// Run-level metadata delivered once, before any frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    /// Base name; sinks derive per-camera names as `{base_name}_{camera_id}`.
    pub base_name: String,
    /// Physical cameras resolved for this run, in production order.
    pub camera_ids: Vec<String>,
    pub time_points: u32,
    pub slices_per_volume: u32,
    /// Inter-slice spacing; sinks record it as the z voxel size.
    pub step_size_um: f64,
    pub channel: String,
    pub started_at: DateTime<Utc>,
}

impl RunMetadata {
    /// Storage name for one camera's image stream.
    pub fn stream_name(&self, camera_id: &str) -> String {
        format!("{}_{}", self.base_name, camera_id)
    }
}

/// How a run ended, delivered once with the final event count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
}

/// Closing report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Events satisfied before the run ended.
    pub events_completed: usize,
    pub ended_at: DateTime<Utc>,
}

/// Consumer of acquired images.
///
/// Calls arrive from the worker task in delivery order; implementations that
/// buffer or write asynchronously must preserve that order per camera.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn sequence_started(&self, run: &RunMetadata) -> anyhow::Result<()>;

    /// One frame, tagged with the acquisition event it satisfies.
    async fn frame_ready(
        &self,
        frame: Frame,
        event: &AcquisitionEvent,
        metadata: &FrameMetadata,
    ) -> anyhow::Result<()>;

    async fn sequence_ended(&self, report: &RunReport) -> anyhow::Result<()>;
}

/// One delivered frame as recorded by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub frame: Frame,
    pub event: AcquisitionEvent,
    pub metadata: FrameMetadata,
}

#[derive(Default)]
struct SinkState {
    started: Vec<RunMetadata>,
    frames: Vec<StoredFrame>,
    ended: Vec<RunReport>,
    fail_on_frame: Option<usize>,
}

/// In-memory sink recording every delivery, for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `frame_ready` fail on the `index`-th delivered frame (0-based).
    pub fn fail_on_frame(&self, index: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fail_on_frame = Some(index);
    }

    pub fn started(&self) -> Vec<RunMetadata> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .started
            .clone()
    }

    pub fn frames(&self) -> Vec<StoredFrame> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frames
            .clone()
    }

    pub fn ended(&self) -> Vec<RunReport> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ended
            .clone()
    }
}

#[async_trait]
impl ImageSink for MemorySink {
    async fn sequence_started(&self, run: &RunMetadata) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.started.push(run.clone());
        Ok(())
    }

    async fn frame_ready(
        &self,
        frame: Frame,
        event: &AcquisitionEvent,
        metadata: &FrameMetadata,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_on_frame == Some(state.frames.len()) {
            anyhow::bail!("simulated storage failure");
        }
        state.frames.push(StoredFrame {
            frame,
            event: event.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    async fn sequence_ended(&self, report: &RunReport) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ended.push(report.clone());
        Ok(())
    }
}
