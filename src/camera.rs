//! Camera boundary: externally triggered frame sources.
//!
//! The engine never talks to camera SDKs directly. It sees one
//! [`FrameSource`], which may stand for a single physical camera or a
//! composite device resolving to several. Identifiers are re-resolved at the
//! start of every run because composite membership can change between runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pixel payload of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl PixelBuffer {
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One image as produced by a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
}

/// Camera-side metadata tagged onto every popped frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Physical camera that produced the frame.
    pub camera_id: String,
    /// Monotonic per-camera frame counter within the sequence.
    pub sequence_number: u64,
    /// Camera hardware timestamp, microseconds since an arbitrary epoch.
    pub hardware_timestamp_us: i64,
    /// Vendor-specific extras, passed through untouched.
    pub extra: Option<serde_json::Value>,
}

/// A frame with the identity tag it arrived with.
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub frame: Frame,
    pub metadata: FrameMetadata,
}

/// Externally triggered frame source (single camera or composite device).
///
/// `pop_frame` never blocks waiting for a frame: callers must check
/// [`FrameSource::remaining`] first and treat an empty pop as an error.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Label of the configured (possibly composite) device.
    fn device_label(&self) -> &str;

    /// Physical camera identifiers behind the device, in production order.
    /// Re-resolved every run.
    async fn camera_ids(&self) -> Result<Vec<String>>;

    /// Switch the device to external hardware triggering.
    async fn arm_external_trigger(&self) -> Result<()>;

    /// Begin a triggered sequence expecting `expected` frames in total
    /// across all physical cameras.
    async fn start_sequence(&self, expected: usize) -> Result<()>;

    /// Stop the running sequence, discarding frames not yet produced.
    async fn stop_sequence(&self) -> Result<()>;

    async fn is_sequence_running(&self) -> bool;

    /// Number of frames buffered and ready to pop.
    async fn remaining(&self) -> usize;

    /// Pop the oldest buffered frame.
    async fn pop_frame(&self) -> Result<TaggedFrame>;

    /// Restore internal (software) triggering after a run.
    async fn reset_internal_trigger(&self) -> Result<()>;
}

fn test_pattern(width: u32, height: u32, seed: u64) -> Frame {
    let n = (width * height) as usize;
    let pixels = (0..n)
        .map(|i| ((i as u64).wrapping_add(seed) & 0xffff) as u16)
        .collect();
    Frame {
        width,
        height,
        pixels: PixelBuffer::U16(pixels),
    }
}

#[derive(Default)]
struct SimShared {
    queue: VecDeque<TaggedFrame>,
    running: bool,
    external_trigger: bool,
    /// When set, frames wait in `pending` until released by the handle.
    paced: bool,
    /// Frames scheduled but not yet surfaced in the queue.
    pending: VecDeque<TaggedFrame>,
}

/// In-memory frame source used in place of real cameras.
///
/// A started sequence schedules all `expected` frames round-robin across the
/// configured cameras (the order hardware-triggered cameras produce them in)
/// and makes them available immediately. In paced mode
/// ([`SimulatedCameraHandle::set_paced`]) delivery is driven from the test.
pub struct SimulatedCameras {
    label: String,
    cameras: Vec<String>,
    width: u32,
    height: u32,
    shared: Arc<Mutex<SimShared>>,
}

/// Inspection/driving handle for [`SimulatedCameras`].
#[derive(Clone)]
pub struct SimulatedCameraHandle {
    shared: Arc<Mutex<SimShared>>,
}

impl SimulatedCameraHandle {
    /// Hold scheduled frames back until [`SimulatedCameraHandle::release`].
    /// Must be set before the sequence starts.
    pub fn set_paced(&self, paced: bool) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.paced = paced;
    }

    /// Move up to `count` scheduled frames into the poppable queue.
    /// Returns how many were released.
    pub fn release(&self, count: usize) -> usize {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        while released < count {
            match shared.pending.pop_front() {
                Some(frame) => {
                    shared.queue.push_back(frame);
                    released += 1;
                }
                None => break,
            }
        }
        released
    }

    /// Release every scheduled frame.
    pub fn release_all(&self) -> usize {
        self.release(usize::MAX)
    }

    /// Release up to `count` scheduled frames from one camera, skipping the
    /// others. Per-camera order is preserved, so arrival order across
    /// cameras can be skewed arbitrarily.
    pub fn release_for(&self, camera_id: &str, count: usize) -> usize {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let mut kept = VecDeque::new();
        let mut released = 0;
        while let Some(frame) = shared.pending.pop_front() {
            if released < count && frame.metadata.camera_id == camera_id {
                shared.queue.push_back(frame);
                released += 1;
            } else {
                kept.push_back(frame);
            }
        }
        shared.pending = kept;
        released
    }

    /// Drop all scheduled frames, simulating a camera that stops producing.
    pub fn starve(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.pending.clear();
    }

    pub fn sequence_running(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    pub fn external_trigger_armed(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .external_trigger
    }
}

impl SimulatedCameras {
    pub fn new(label: impl Into<String>, cameras: Vec<String>) -> Self {
        Self {
            label: label.into(),
            cameras,
            width: 64,
            height: 64,
            shared: Arc::new(Mutex::new(SimShared::default())),
        }
    }

    /// Single-camera convenience.
    pub fn single(camera_id: impl Into<String>) -> Self {
        let id = camera_id.into();
        Self::new(id.clone(), vec![id])
    }

    pub fn handle(&self) -> SimulatedCameraHandle {
        SimulatedCameraHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl FrameSource for SimulatedCameras {
    fn device_label(&self) -> &str {
        &self.label
    }

    async fn camera_ids(&self) -> Result<Vec<String>> {
        Ok(self.cameras.clone())
    }

    async fn arm_external_trigger(&self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.external_trigger = true;
        Ok(())
    }

    async fn start_sequence(&self, expected: usize) -> Result<()> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if shared.running {
            return Err(anyhow!("sequence already running on '{}'", self.label));
        }
        shared.running = true;
        shared.queue.clear();
        shared.pending.clear();

        // Round-robin across cameras, matching triggered production order.
        let mut counters = vec![0u64; self.cameras.len()];
        for i in 0..expected {
            let cam = i % self.cameras.len();
            let sequence_number = counters[cam];
            counters[cam] += 1;
            shared.pending.push_back(TaggedFrame {
                frame: test_pattern(self.width, self.height, i as u64),
                metadata: FrameMetadata {
                    camera_id: self.cameras[cam].clone(),
                    sequence_number,
                    hardware_timestamp_us: i as i64 * 1_000,
                    extra: None,
                },
            });
        }
        if !shared.paced {
            let mut scheduled = std::mem::take(&mut shared.pending);
            shared.queue.append(&mut scheduled);
        }
        debug!(device = %self.label, expected, "simulated sequence started");
        Ok(())
    }

    async fn stop_sequence(&self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.running = false;
        shared.pending.clear();
        Ok(())
    }

    async fn is_sequence_running(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    async fn remaining(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    async fn pop_frame(&self) -> Result<TaggedFrame> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared
            .queue
            .pop_front()
            .ok_or_else(|| anyhow!("no frame buffered on '{}'", self.label))
    }

    async fn reset_internal_trigger(&self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.external_trigger = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn composite_resolves_all_cameras() {
        let cams = SimulatedCameras::new(
            "Dual-sCMOS",
            vec!["Camera-1".to_string(), "Camera-2".to_string()],
        );
        assert_eq!(cams.camera_ids().await.unwrap(), vec!["Camera-1", "Camera-2"]);
        assert_eq!(cams.device_label(), "Dual-sCMOS");
    }

    #[tokio::test]
    async fn sequence_produces_round_robin_tagged_frames() {
        let cams = SimulatedCameras::new(
            "Dual-sCMOS",
            vec!["Camera-1".to_string(), "Camera-2".to_string()],
        );
        cams.arm_external_trigger().await.unwrap();
        cams.start_sequence(4).await.unwrap();
        assert!(cams.is_sequence_running().await);
        assert_eq!(cams.remaining().await, 4);

        let first = cams.pop_frame().await.unwrap();
        assert_eq!(first.metadata.camera_id, "Camera-1");
        assert_eq!(first.metadata.sequence_number, 0);
        let second = cams.pop_frame().await.unwrap();
        assert_eq!(second.metadata.camera_id, "Camera-2");
        assert_eq!(second.metadata.sequence_number, 0);
        let third = cams.pop_frame().await.unwrap();
        assert_eq!(third.metadata.camera_id, "Camera-1");
        assert_eq!(third.metadata.sequence_number, 1);
        assert_eq!(cams.remaining().await, 1);
    }

    #[tokio::test]
    async fn empty_pop_is_an_error() {
        let cams = SimulatedCameras::single("Camera-1");
        cams.start_sequence(1).await.unwrap();
        cams.pop_frame().await.unwrap();
        assert!(cams.pop_frame().await.is_err());
    }

    #[tokio::test]
    async fn stop_and_reset_clear_sequence_state() {
        let cams = SimulatedCameras::single("Camera-1");
        let handle = cams.handle();
        cams.arm_external_trigger().await.unwrap();
        cams.start_sequence(2).await.unwrap();
        assert!(handle.external_trigger_armed());

        cams.stop_sequence().await.unwrap();
        assert!(!cams.is_sequence_running().await);
        cams.reset_internal_trigger().await.unwrap();
        assert!(!handle.external_trigger_armed());
    }

    #[tokio::test]
    async fn paced_mode_holds_frames_until_released() {
        let cams = SimulatedCameras::single("Camera-1");
        let handle = cams.handle();
        handle.set_paced(true);
        cams.start_sequence(3).await.unwrap();

        assert_eq!(cams.remaining().await, 0);
        assert_eq!(handle.release(2), 2);
        assert_eq!(cams.remaining().await, 2);
        handle.starve();
        assert_eq!(handle.release_all(), 0);
        assert_eq!(cams.remaining().await, 2);
    }

    #[tokio::test]
    async fn release_for_skews_arrival_order_across_cameras() {
        let cams = SimulatedCameras::new(
            "Dual-sCMOS",
            vec!["Camera-1".to_string(), "Camera-2".to_string()],
        );
        let handle = cams.handle();
        handle.set_paced(true);
        cams.start_sequence(4).await.unwrap();

        assert_eq!(handle.release_for("Camera-2", usize::MAX), 2);
        assert_eq!(handle.release_for("Camera-1", usize::MAX), 2);

        // Both Camera-2 frames arrive first, each camera's own order intact.
        let order: Vec<(String, u64)> = {
            let mut popped = Vec::new();
            while cams.remaining().await > 0 {
                let f = cams.pop_frame().await.unwrap();
                popped.push((f.metadata.camera_id, f.metadata.sequence_number));
            }
            popped
        };
        assert_eq!(
            order,
            vec![
                ("Camera-2".to_string(), 0),
                ("Camera-2".to_string(), 1),
                ("Camera-1".to_string(), 0),
                ("Camera-1".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let cams = SimulatedCameras::single("Camera-1");
        cams.start_sequence(1).await.unwrap();
        assert!(cams.start_sequence(1).await.is_err());
    }
}
