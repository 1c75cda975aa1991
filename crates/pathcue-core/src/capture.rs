//! The single capture device shared by every session's detection loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{Camera, CameraFactory, Frame};

pub enum CaptureRead {
    Frame(Frame),
    /// Device could not be opened
    Unavailable,
    /// Device is open but produced no frame this time
    Dropped,
}

pub struct SharedCapture {
    factory: Arc<dyn CameraFactory>,
    device: Mutex<Option<Box<dyn Camera>>>,
}

impl SharedCapture {
    pub fn new(factory: Arc<dyn CameraFactory>) -> Self {
        Self { factory, device: Mutex::new(None) }
    }

    /// Open the device unless an open one is already held. A device that
    /// failed to open is replaced.
    pub fn acquire(&self) {
        let mut dev = self.device.lock();
        if dev.as_ref().map_or(true, |cam| !cam.is_opened()) {
            info!("opening capture device");
            *dev = Some(self.factory.open());
        }
    }

    /// Read one frame. Never opens the device; a released device reads as
    /// unavailable until the next `acquire`.
    pub fn read(&self) -> CaptureRead {
        let mut dev = self.device.lock();
        let Some(cam) = dev.as_mut() else {
            return CaptureRead::Unavailable;
        };
        if !cam.is_opened() {
            return CaptureRead::Unavailable;
        }
        match cam.read() {
            Some(frame) => CaptureRead::Frame(frame),
            None => CaptureRead::Dropped,
        }
    }

    pub fn release(&self) {
        self.release_when(|| true);
    }

    /// Release the device if `idle` holds. `idle` is evaluated under the
    /// device lock, so an `acquire` that starts after it returns `false`
    /// keeps the device, and one that starts after the release reopens it.
    pub fn release_when(&self, idle: impl FnOnce() -> bool) -> bool {
        let mut dev = self.device.lock();
        if dev.is_none() || !idle() {
            return false;
        }
        if let Some(mut cam) = dev.take() {
            cam.release();
            info!("capture device released");
        }
        true
    }

    pub fn is_acquired(&self) -> bool {
        self.device.lock().is_some()
    }
}
