//! Exclusive ownership of the camera across connections.
//!
//! There is one physical camera per process. A connection claims it with
//! [`Device::try_claim`] for the duration of a capture or a streaming
//! session; a second claimant gets [`ServerError::DeviceBusy`] instead of
//! corrupting the first connection's pipeline.

use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::camera::{Camera, CameraError, CameraResult};
use crate::error::{ServerError, ServerResult};

type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

/// Process-wide handle to the camera.
#[derive(Clone)]
pub struct Device {
    camera: SharedCamera,
    name: Arc<str>,
    claim: Arc<Semaphore>,
    holder: Arc<Mutex<Option<String>>>,
}

impl Device {
    /// Wraps a camera backend.
    pub fn new(camera: impl Camera) -> Self {
        let name: Arc<str> = Arc::from(camera.name());
        debug!(camera = %name, "Camera attached");
        Self {
            camera: Arc::new(Mutex::new(Box::new(camera))),
            name,
            claim: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Claims the camera without waiting.
    ///
    /// `purpose` is reported to anyone who finds the device busy.
    pub fn try_claim(&self, purpose: impl Into<String>) -> ServerResult<DeviceLease> {
        let purpose = purpose.into();
        match Arc::clone(&self.claim).try_acquire_owned() {
            Ok(permit) => {
                if let Ok(mut holder) = self.holder.lock() {
                    *holder = Some(purpose.clone());
                }
                debug!(purpose = %purpose, "Camera claimed");
                Ok(DeviceLease {
                    camera: Arc::clone(&self.camera),
                    holder: Arc::clone(&self.holder),
                    purpose,
                    _permit: permit,
                })
            }
            Err(_) => Err(ServerError::DeviceBusy {
                holder: self.holder().unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }

    /// Returns true when nobody holds the camera.
    pub fn is_idle(&self) -> bool {
        self.claim.available_permits() == 1
    }

    /// Backend name reported by the camera.
    pub fn camera_name(&self) -> &str {
        &self.name
    }

    /// What the current holder is doing, if anyone holds the camera.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().ok().and_then(|h| h.clone())
    }
}

/// Exclusive access to the camera; released on drop.
pub struct DeviceLease {
    camera: SharedCamera,
    holder: Arc<Mutex<Option<String>>>,
    purpose: String,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLease {
    /// Runs a blocking camera operation off the async executor.
    pub async fn run<T, F>(&self, op: F) -> CameraResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Camera) -> CameraResult<T> + Send + 'static,
    {
        let camera = Arc::clone(&self.camera);
        tokio::task::spawn_blocking(move || {
            let mut guard = camera
                .lock()
                .map_err(|_| CameraError::Backend("camera mutex poisoned".into()))?;
            op(guard.as_mut())
        })
        .await
        .map_err(|e| CameraError::Backend(format!("camera task failed: {e}")))?
    }

    /// Stops a recording that nobody is going to stop cleanly.
    ///
    /// Used when a session is dropped mid-recording. The blocking stop is
    /// handed to the runtime if one is available; the lease is held until
    /// it completes.
    pub fn abandon(self) {
        let stop = move |lease: DeviceLease| {
            if let Ok(mut camera) = lease.camera.lock() {
                if let Err(e) = camera.stop_recording() {
                    warn!(purpose = %lease.purpose, error = %e, "Failed to stop recording after abandoned session");
                }
                if let Err(e) = camera.stop() {
                    warn!(error = %e, "Failed to stop camera after abandoned session");
                }
            }
            drop(lease);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || stop(self));
            }
            Err(_) => stop(self),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut holder) = self.holder.lock() {
            *holder = None;
        }
        debug!(purpose = %self.purpose, "Camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCamera;
    use picam_core::{ImageFormat, Resolution};

    #[tokio::test]
    async fn second_claim_is_busy() {
        let device = Device::new(SimulatedCamera::new());
        let lease = device.try_claim("capture").unwrap();
        assert!(!device.is_idle());
        assert_eq!(device.holder().as_deref(), Some("capture"));

        let err = device.try_claim("start_video").err().unwrap();
        match err {
            ServerError::DeviceBusy { holder } => assert_eq!(holder, "capture"),
            other => panic!("expected DeviceBusy, got {other:?}"),
        }

        drop(lease);
        assert!(device.is_idle());
        assert_eq!(device.holder(), None);
        assert!(device.try_claim("start_video").is_ok());
    }

    #[test]
    fn camera_name_comes_from_the_backend() {
        let device = Device::new(SimulatedCamera::new());
        assert_eq!(device.camera_name(), "simulated");
        assert_eq!(device.clone().camera_name(), "simulated");
    }

    #[tokio::test]
    async fn abandon_releases_even_when_stop_recording_fails() {
        let device = Device::new(SimulatedCamera::new());
        let lease = device.try_claim("start_video").unwrap();
        // Nothing is recording, so the stop fails with NotRecording.
        lease.abandon();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !device.is_idle() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(device.holder(), None);
    }

    #[test]
    fn abandon_without_runtime_stops_inline() {
        let device = Device::new(SimulatedCamera::new());
        device.try_claim("start_video").unwrap().abandon();
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn run_executes_on_camera() {
        let device = Device::new(SimulatedCamera::new());
        let lease = device.try_claim("capture").unwrap();
        let bytes = lease
            .run(|camera| {
                camera.configure_still(Resolution::new(640, 480))?;
                camera.start()?;
                let data = camera.capture(ImageFormat::Gif)?;
                camera.stop()?;
                Ok(data)
            })
            .await
            .unwrap();
        assert!(bytes.starts_with(b"GIF89a"));
    }

    #[tokio::test]
    async fn run_propagates_camera_errors() {
        let device = Device::new(SimulatedCamera::new());
        let lease = device.try_claim("capture").unwrap();
        let err = lease
            .run(|camera| camera.capture(ImageFormat::Jpeg))
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::NotConfigured("still"));
    }
}
