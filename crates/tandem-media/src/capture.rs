//! Capture devices of the host machine.
//!
//! The microphone is found through cpal's default host. Cameras are
//! enumerated with nokhwa when the `camera` feature is on; without it every
//! video acquire fails with [`MediaError::DeviceUnavailable`].
//!
//! Device queries block, so they run on tokio's blocking pool.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_shared::MediaKind;
use tracing::{debug, info, warn};

use crate::engine::{LocalMedia, LocalTrack, MediaDevices, MediaError, TrackKind};

/// Synchronous lookup of the devices a call would capture from. Each method
/// returns the device name.
pub trait CaptureHost: Send + Sync + 'static {
    fn microphone(&self) -> Result<String, MediaError>;
    fn camera(&self) -> Result<String, MediaError>;
}

/// cpal for audio input, nokhwa for cameras.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeHost;

impl CaptureHost for NativeHost {
    fn microphone(&self) -> Result<String, MediaError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".into()))?;
        let name = device
            .name()
            .map_err(|e| MediaError::DeviceUnavailable(format!("audio input: {e}")))?;

        // Opening the default config catches devices that are listed but
        // unusable (unplugged, exclusively held).
        let config = device
            .default_input_config()
            .map_err(|e| MediaError::DeviceUnavailable(format!("{name}: {e}")))?;
        debug!(
            host = ?host.id(),
            device = %name,
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "audio input found"
        );
        Ok(name)
    }

    #[cfg(feature = "camera")]
    fn camera(&self) -> Result<String, MediaError> {
        use nokhwa::utils::ApiBackend;

        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| MediaError::DeviceUnavailable(format!("camera query: {e}")))?;
        let first = cameras
            .first()
            .ok_or_else(|| MediaError::DeviceUnavailable("no camera".into()))?;
        debug!(count = cameras.len(), device = %first.human_name(), "camera found");
        Ok(first.human_name())
    }

    #[cfg(not(feature = "camera"))]
    fn camera(&self) -> Result<String, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "camera support not built in (enable the `camera` feature)".into(),
        ))
    }
}

/// [`MediaDevices`] backed by the host's real devices.
#[derive(Debug, Clone)]
pub struct SystemDevices<H = NativeHost> {
    host: Arc<H>,
}

impl SystemDevices {
    pub fn new() -> Self {
        Self::with_host(NativeHost)
    }
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: CaptureHost> SystemDevices<H> {
    pub fn with_host(host: H) -> Self {
        Self {
            host: Arc::new(host),
        }
    }
}

#[async_trait]
impl<H: CaptureHost> MediaDevices for SystemDevices<H> {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        let host = self.host.clone();
        let wants_video = kind.wants_video();

        let (microphone, camera) = tokio::task::spawn_blocking(move || {
            let microphone = host.microphone()?;
            let camera = if wants_video {
                Some(host.camera()?)
            } else {
                None
            };
            Ok::<_, MediaError>((microphone, camera))
        })
        .await
        .map_err(|e| MediaError::DeviceUnavailable(format!("device query aborted: {e}")))?
        .inspect_err(|e| warn!(kind = kind.as_str(), error = %e, "capture unavailable"))?;

        info!(%microphone, camera = ?camera, "capture devices acquired");
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, "audio").with_device(microphone)];
        if let Some(camera) = camera {
            tracks.push(LocalTrack::new(TrackKind::Video, "video").with_device(camera));
        }
        Ok(LocalMedia::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A host with a fixed set of devices that counts camera lookups.
    #[derive(Default)]
    struct StaticHost {
        microphone: Option<&'static str>,
        camera: Option<&'static str>,
        camera_lookups: AtomicUsize,
    }

    impl CaptureHost for Arc<StaticHost> {
        fn microphone(&self) -> Result<String, MediaError> {
            self.microphone
                .map(str::to_string)
                .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".into()))
        }

        fn camera(&self) -> Result<String, MediaError> {
            self.camera_lookups.fetch_add(1, Ordering::SeqCst);
            self.camera
                .map(str::to_string)
                .ok_or_else(|| MediaError::DeviceUnavailable("no camera".into()))
        }
    }

    fn host(microphone: Option<&'static str>, camera: Option<&'static str>) -> Arc<StaticHost> {
        Arc::new(StaticHost {
            microphone,
            camera,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_headless_host_has_no_video() {
        let devices = SystemDevices::with_host(host(None, None));
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let err = devices.acquire(kind).await.unwrap_err();
            assert!(matches!(err, MediaError::DeviceUnavailable(_)), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn test_video_needs_a_camera() {
        let h = host(Some("Built-in Microphone"), None);
        let devices = SystemDevices::with_host(h.clone());

        let err = devices.acquire(MediaKind::Video).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceUnavailable("no camera".into()));

        let media = devices.acquire(MediaKind::Audio).await.unwrap();
        assert_eq!(media.tracks().len(), 1);
        assert_eq!(media.tracks()[0].device.as_deref(), Some("Built-in Microphone"));
        // Audio calls never look for a camera.
        assert_eq!(h.camera_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_video_call_names_both_devices() {
        let devices = SystemDevices::with_host(host(Some("USB Mic"), Some("FaceTime HD")));
        let media = devices.acquire(MediaKind::Video).await.unwrap();

        let named: Vec<_> = media
            .tracks()
            .iter()
            .map(|t| (t.kind, t.device.as_deref()))
            .collect();
        assert_eq!(
            named,
            vec![
                (TrackKind::Audio, Some("USB Mic")),
                (TrackKind::Video, Some("FaceTime HD")),
            ]
        );
        assert!(media.is_live());
    }

    #[cfg(not(feature = "camera"))]
    #[test]
    fn test_camera_without_backend_is_unavailable() {
        assert!(matches!(
            NativeHost.camera(),
            Err(MediaError::DeviceUnavailable(_))
        ));
    }
}
