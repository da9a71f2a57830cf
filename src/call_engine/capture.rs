//! Mikrofon-Capture über cpal
//!
//! Jeder Audio-Track bekommt einen eigenen Thread, der den cpal Stream
//! besitzt (Streams sind nicht Send). Der Thread läuft bis der Track
//! gestoppt wird. Kamera und Bildschirm werden hier nicht unterstützt.

use super::devices::{DeviceError, MediaDeviceInfo, MediaDevices, TrackConstraints, DEFAULT_DEVICE_ID};
use super::track::{LocalTrack, TrackKind, TrackOrigin, TrackSource};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::oneshot;

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// CPAL DEVICES
// ============================================================================

/// `MediaDevices` für Audio-Eingänge des Standard-Hosts
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }

    fn find_device(device_id: Option<&str>) -> Result<(Device, String), DeviceError> {
        let host = cpal::default_host();

        match device_id {
            None | Some(DEFAULT_DEVICE_ID) => {
                let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
                let name = device.name().unwrap_or_else(|_| "Default".to_string());
                Ok((device, name))
            }
            Some(id) => host
                .input_devices()
                .map_err(|e| DeviceError::Hardware(e.to_string()))?
                .find(|d| d.name().map(|name| name == id).unwrap_or(false))
                .map(|d| (d, id.to_string()))
                .ok_or_else(|| DeviceError::NotFound(id.to_string())),
        }
    }

    /// Wählt die beste Konfiguration: 48kHz F32, sonst F32, sonst die erste
    fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, DeviceError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);
        let supports_target =
            |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

        if let Some(config) = configs
            .iter()
            .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }

        if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
            return Ok(config.with_max_sample_rate().into());
        }

        configs
            .first()
            .map(|c| c.with_max_sample_rate().into())
            .ok_or_else(|| DeviceError::Unsupported("no usable input configuration".to_string()))
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, DeviceError> {
        let host = cpal::default_host();
        let mut found = Vec::new();

        if let Some(device) = host.default_input_device() {
            found.push(MediaDeviceInfo {
                id: DEFAULT_DEVICE_ID.to_string(),
                label: device.name().unwrap_or_default(),
                kind: TrackKind::Audio,
            });
        }

        let inputs = host
            .input_devices()
            .map_err(|e| DeviceError::Hardware(e.to_string()))?;
        for device in inputs {
            match device.name() {
                Ok(name) => found.push(MediaDeviceInfo {
                    id: name.clone(),
                    label: name,
                    kind: TrackKind::Audio,
                }),
                Err(e) => tracing::warn!("Skipping input device without name: {}", e),
            }
        }

        Ok(found)
    }

    async fn probe_permissions(&self) -> Result<(), DeviceError> {
        // Desktop-Hosts liefern Namen ohne Berechtigungsabfrage
        Ok(())
    }

    async fn open(&self, constraints: TrackConstraints) -> Result<LocalTrack, DeviceError> {
        if constraints.kind != TrackKind::Audio {
            return Err(DeviceError::Unsupported("video capture".to_string()));
        }

        // Nur für das Label, der Thread öffnet das Gerät selbst
        let label = Self::find_device(constraints.device_id.as_deref())?.1;

        let level = Arc::new(Mutex::new(0.0f32));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let source = CaptureSource {
            stop: Mutex::new(Some(stop_tx)),
            level: Arc::clone(&level),
        };
        let track = LocalTrack::new(
            TrackKind::Audio,
            TrackOrigin::Device,
            label,
            constraints.device_id.clone(),
            Box::new(source),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let device_id = constraints.device_id;
        let enabled = track.enabled_flag();
        std::thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || run_capture(device_id, enabled, level, stop_rx, ready_tx))
            .map_err(|e| DeviceError::Hardware(e.to_string()))?;

        let started = ready_rx
            .await
            .unwrap_or_else(|_| Err(DeviceError::Hardware("capture thread exited".to_string())));
        if let Err(e) = started {
            track.stop();
            return Err(e);
        }
        Ok(track)
    }

    async fn open_display(&self) -> Result<LocalTrack, DeviceError> {
        Err(DeviceError::Unsupported("screen capture".to_string()))
    }
}

// ============================================================================
// CAPTURE THREAD
// ============================================================================

fn run_capture(
    device_id: Option<String>,
    enabled: Arc<AtomicBool>,
    level: Arc<Mutex<f32>>,
    stop: mpsc::Receiver<()>,
    ready: oneshot::Sender<Result<(), DeviceError>>,
) {
    match start_stream(device_id.as_deref(), enabled, level) {
        Ok((stream, label)) => {
            tracing::debug!("Capture running on {}", label);
            if ready.send(Ok(())).is_err() {
                return;
            }
            // Blockiert bis der Track gestoppt wird
            let _ = stop.recv();
            drop(stream);
            tracing::info!("Audio capture stopped");
        }
        Err(e) => {
            tracing::error!("Failed to start audio capture: {}", e);
            let _ = ready.send(Err(e));
        }
    }
}

fn start_stream(
    device_id: Option<&str>,
    enabled: Arc<AtomicBool>,
    level: Arc<Mutex<f32>>,
) -> Result<(Stream, String), DeviceError> {
    let (device, label) = CpalDevices::find_device(device_id)?;
    let configs = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Hardware(e.to_string()))?;
    let config = CpalDevices::select_best_config(configs.collect())?;

    tracing::info!(
        "Starting audio capture on {}: {} Hz, {} channels",
        label,
        config.sample_rate.0,
        config.channels
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Relaxed) || data.is_empty() {
                    *level.lock() = 0.0;
                    return;
                }
                let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *level.lock() = rms.min(1.0);
            },
            |err| tracing::error!("Audio capture error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NoDevice,
            other => DeviceError::Hardware(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| DeviceError::Hardware(e.to_string()))?;
    Ok((stream, label))
}

struct CaptureSource {
    stop: Mutex<Option<mpsc::Sender<()>>>,
    level: Arc<Mutex<f32>>,
}

impl TrackSource for CaptureSource {
    fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }

    fn level(&self) -> f32 {
        *self.level.lock()
    }
}
