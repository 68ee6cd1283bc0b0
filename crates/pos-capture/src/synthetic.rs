use std::collections::HashSet;

use anyhow::{bail, Result};
use image::{Rgba, RgbaImage};

use crate::{CameraBackend, CameraDevice, FrameSource};

/// Camera backend producing deterministic test-pattern frames, used in
/// tests and wherever the engine runs without camera hardware.
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    devices: Vec<CameraDevice>,
    failing: HashSet<String>,
    resolution: (u32, u32),
}

impl SyntheticBackend {
    pub fn new(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            failing: HashSet::new(),
            resolution: (320, 240),
        }
    }

    /// One device named `label`, id `cam0`.
    pub fn single(label: &str) -> Self {
        Self::new(vec![CameraDevice {
            id: "cam0".to_string(),
            label: label.to_string(),
        }])
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Marks a device as un-openable, to exercise fallback acquisition.
    pub fn with_failing_device(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }
}

impl CameraBackend for SyntheticBackend {
    fn enumerate(&self) -> Result<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    fn open(&self, device: &CameraDevice) -> Result<Box<dyn FrameSource>> {
        if self.failing.contains(&device.id) {
            bail!("device {} is not accessible", device.label);
        }
        Ok(Box::new(SyntheticSource {
            device: device.clone(),
            width: self.resolution.0,
            height: self.resolution.1,
            frame_index: 0,
        }))
    }
}

/// Frame source that fills each frame with a shade derived from the frame
/// index, so consecutive frames are distinguishable.
#[derive(Debug)]
pub struct SyntheticSource {
    device: CameraDevice,
    width: u32,
    height: u32,
    frame_index: u32,
}

impl FrameSource for SyntheticSource {
    fn device(&self) -> &CameraDevice {
        &self.device
    }

    fn grab(&mut self) -> Result<RgbaImage> {
        let shade = ((self.frame_index * 16) % 256) as u8;
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(RgbaImage::from_pixel(
            self.width,
            self.height,
            Rgba([shade, shade, shade, 255]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_frames_differ() {
        let backend = SyntheticBackend::single("Test Camera");
        let device = backend.enumerate().unwrap().remove(0);
        let mut source = backend.open(&device).unwrap();

        let first = source.grab().unwrap();
        let second = source.grab().unwrap();
        assert_ne!(first.get_pixel(0, 0), second.get_pixel(0, 0));
        assert_eq!(first.dimensions(), (320, 240));
    }

    #[test]
    fn failing_device_refuses_to_open() {
        let backend = SyntheticBackend::single("Test Camera").with_failing_device("cam0");
        let device = backend.enumerate().unwrap().remove(0);
        assert!(backend.open(&device).is_err());
    }
}
