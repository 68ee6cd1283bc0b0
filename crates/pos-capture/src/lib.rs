use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use synthetic::{SyntheticBackend, SyntheticSource};

pub mod synthetic;

/// A camera attached to the host, as presented to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
}

/// An opened camera producing raw frames. Implementations are synchronous;
/// the sampling loop moves grabs onto a blocking thread.
pub trait FrameSource: Send {
    fn device(&self) -> &CameraDevice;

    fn grab(&mut self) -> Result<RgbaImage>;
}

/// Host binding for camera discovery and acquisition. The embedding shell
/// supplies the real implementation (V4L2, AVFoundation, a browser bridge);
/// [`SyntheticBackend`] stands in wherever no hardware is available.
pub trait CameraBackend: Send + Sync {
    fn enumerate(&self) -> Result<Vec<CameraDevice>>;

    fn open(&self, device: &CameraDevice) -> Result<Box<dyn FrameSource>>;
}

/// Destination for encoded frames. The detection channel implements this;
/// a failed submit means the frame is skipped, never queued or retried.
pub trait FrameSink: Send + Sync {
    fn submit(&self, jpeg: Vec<u8>) -> Result<()>;
}

/// Status of the sampling loop, published on a watch channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerStatus {
    pub is_sampling: bool,
    pub device_label: Option<String>,
    pub fps: f64,
    pub last_frame_at: Option<u64>,
    pub resolution: Option<(u32, u32)>,
}

impl Default for SamplerStatus {
    fn default() -> Self {
        Self {
            is_sampling: false,
            device_label: None,
            fps: 0.0,
            last_frame_at: None,
            resolution: None,
        }
    }
}

/// Label fragments that mark a rear-facing camera on common hosts.
const REAR_LABEL_HINTS: &[&str] = &["back", "rear", "environment"];

/// Picks the device to select by default: a rear-facing camera when the
/// label gives one away, otherwise the first device.
pub fn pick_preferred_device(devices: &[CameraDevice]) -> Option<&CameraDevice> {
    devices
        .iter()
        .find(|device| {
            let label = device.label.to_lowercase();
            REAR_LABEL_HINTS.iter().any(|hint| label.contains(hint))
        })
        .or_else(|| devices.first())
}

/// Opens the selected camera, falling back once to any other available
/// device before surfacing the failure.
pub fn acquire_with_fallback(
    backend: &dyn CameraBackend,
    selected: Option<&str>,
) -> Result<Box<dyn FrameSource>> {
    let devices = backend
        .enumerate()
        .context("failed to enumerate camera devices")?;
    if devices.is_empty() {
        bail!("no camera devices available");
    }

    let Some(primary) = selected
        .and_then(|id| devices.iter().find(|device| device.id == id))
        .or_else(|| pick_preferred_device(&devices))
    else {
        bail!("no camera devices available");
    };

    match backend.open(primary) {
        Ok(source) => return Ok(source),
        Err(err) => warn!(device = %primary.label, "camera open failed: {err}"),
    }

    let fallback = devices.iter().find(|device| device.id != primary.id);
    match fallback {
        Some(device) => {
            info!(device = %device.label, "falling back to alternate camera");
            backend
                .open(device)
                .with_context(|| format!("fallback camera {} failed", device.label))
        }
        None => bail!("camera {} could not be opened", primary.label),
    }
}

/// Stretch-resizes a frame to `edge`x`edge` and JPEG-encodes it. The
/// detector expects a fixed square input regardless of the source aspect
/// ratio; the frame is stretched to fit, never letterboxed.
pub fn encode_frame(frame: &RgbaImage, edge: u32) -> Result<Vec<u8>> {
    let resized = image::imageops::resize(frame, edge, edge, image::imageops::FilterType::Triangle);
    let rgb = DynamicImage::ImageRgba8(resized).to_rgb8();

    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("jpeg encode failed")?;
    Ok(bytes)
}

/// The sampling loop that runs as a background task while a session is
/// capturing. Grabs a frame on each tick, encodes it, and hands it to the
/// sink. The cadence is a best-effort target, not a delivery guarantee: a
/// failed grab or submit skips the tick silently, and the stop flag wins
/// immediately (no frame is submitted after stop is observed).
pub async fn sampling_loop(
    mut source: Box<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    status_tx: watch::Sender<SamplerStatus>,
    interval: Duration,
    edge: u32,
    stop: Arc<AtomicBool>,
) {
    info!(device = %source.device().label, "sampling loop started, interval: {:?}", interval);

    let mut frame_count = 0u64;
    let mut fps_timer = Instant::now();

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let tick_start = Instant::now();
        let label = source.device().label.clone();

        let grab_result = tokio::task::spawn_blocking(move || {
            let encoded = source.grab().and_then(|frame| {
                let resolution = (frame.width(), frame.height());
                encode_frame(&frame, edge).map(|jpeg| (jpeg, resolution))
            });
            (source, encoded)
        })
        .await;

        let encoded = match grab_result {
            Ok((returned, encoded)) => {
                source = returned;
                encoded
            }
            Err(err) => {
                warn!("sampling task panicked: {err}");
                break;
            }
        };

        match encoded {
            Ok((jpeg, resolution)) => {
                frame_count += 1;

                let elapsed = fps_timer.elapsed().as_secs_f64();
                let fps = if elapsed > 0.0 {
                    frame_count as f64 / elapsed
                } else {
                    0.0
                };
                if elapsed > 5.0 {
                    frame_count = 0;
                    fps_timer = Instant::now();
                }

                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;

                let _ = status_tx.send(SamplerStatus {
                    is_sampling: true,
                    device_label: Some(label),
                    fps,
                    last_frame_at: Some(now),
                    resolution: Some(resolution),
                });

                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = sink.submit(jpeg) {
                    debug!("frame skipped: {err}");
                }
            }
            Err(err) => {
                debug!("frame grab skipped: {err}");
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }

    let _ = status_tx.send(SamplerStatus::default());
    info!("sampling loop stopped");
}
