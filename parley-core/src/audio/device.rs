//! Audio device capability layer.
//!
//! Capture and playback talk to hardware only through [`AudioDevice`], so
//! the VAD, framing and barge-in logic can be exercised with fakes.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`CpalDevice`] therefore builds every stream on a dedicated OS
//! thread that owns it for its whole life; the returned [`ActiveStream`]
//! handle is `Send` and stops that thread on `close()` / drop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    audio::{
        playback::{PlaybackConfig, PlaybackQueue},
        CaptureConfig,
    },
    buffering::AudioProducer,
    error::Result,
};

/// An open device stream. Dropping or closing it releases the device.
pub trait ActiveStream: Send {
    /// Actual rate the device runs at (Hz).
    fn sample_rate(&self) -> u32;

    /// Interleaved channel count of the device stream.
    fn channels(&self) -> u16;

    /// Stop the stream and release the device. Idempotent.
    fn close(&mut self);
}

/// Host audio capability: microphone in, speaker out.
pub trait AudioDevice: Send + Sync + 'static {
    /// Open the microphone and push downmixed mono f32 samples, at the
    /// stream's own rate, into `producer` from the device callback.
    ///
    /// # Errors
    /// A device error when access is denied or no compatible input exists.
    /// Nothing stays open on failure.
    fn open_input(
        &self,
        config: &CaptureConfig,
        producer: AudioProducer,
    ) -> Result<Box<dyn ActiveStream>>;

    /// Open the speaker; the device callback pulls mono samples from `source`.
    ///
    /// # Errors
    /// A device error when no compatible output exists.
    fn open_output(
        &self,
        config: &PlaybackConfig,
        source: Arc<PlaybackQueue>,
    ) -> Result<Box<dyn ActiveStream>>;
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
}

#[cfg(feature = "audio-cpal")]
pub use self::cpal_backend::{list_input_devices, list_output_devices, CpalDevice};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    };
    use crossbeam_channel::{bounded, Sender};
    use tracing::{debug, error, info, warn};

    use super::{ActiveStream, AudioDevice, DeviceInfo};
    use crate::{
        audio::{playback::PlaybackConfig, playback::PlaybackQueue, CaptureConfig},
        buffering::{AudioProducer, Producer},
        error::{ParleyError, Result},
    };

    /// The real host backend (default cpal host).
    #[derive(Debug, Clone, Default)]
    pub struct CpalDevice;

    impl CpalDevice {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioDevice for CpalDevice {
        fn open_input(
            &self,
            config: &CaptureConfig,
            producer: AudioProducer,
        ) -> Result<Box<dyn ActiveStream>> {
            let config = config.clone();
            spawn_stream("parley-mic", move || {
                let host = cpal::default_host();
                let device = select_device(&host, config.preferred_device.as_deref(), true)?;
                info!(
                    device = device.name().unwrap_or_default().as_str(),
                    "opening input device"
                );

                if config.echo_cancellation {
                    debug!("echo cancellation requested but not offered by the host backend");
                }

                let (format, stream_config) = choose_input_config(&device, config.sample_rate)?;
                info!(
                    sample_rate = stream_config.sample_rate.0,
                    channels = stream_config.channels,
                    ?format,
                    "input config selected"
                );

                let stream = match format {
                    SampleFormat::F32 => build_input::<f32>(&device, &stream_config, producer),
                    SampleFormat::I16 => build_input::<i16>(&device, &stream_config, producer),
                    SampleFormat::U16 => build_input::<u16>(&device, &stream_config, producer),
                    fmt => {
                        return Err(ParleyError::AudioStream(format!(
                            "unsupported input sample format: {fmt:?}"
                        )))
                    }
                }
                .map_err(|e| ParleyError::Device(e.to_string()))?;

                stream
                    .play()
                    .map_err(|e| ParleyError::AudioStream(e.to_string()))?;
                Ok((stream, stream_config.sample_rate.0, stream_config.channels))
            })
        }

        fn open_output(
            &self,
            config: &PlaybackConfig,
            source: Arc<PlaybackQueue>,
        ) -> Result<Box<dyn ActiveStream>> {
            let preferred = config.preferred_device.clone();
            spawn_stream("parley-speaker", move || {
                let host = cpal::default_host();
                let device = select_device(&host, preferred.as_deref(), false)?;
                info!(
                    device = device.name().unwrap_or_default().as_str(),
                    "opening output device"
                );

                let supported = device
                    .default_output_config()
                    .map_err(|e| ParleyError::Device(e.to_string()))?;
                let format = supported.sample_format();
                let stream_config: StreamConfig = supported.config();

                let stream = match format {
                    SampleFormat::F32 => build_output::<f32>(&device, &stream_config, source),
                    SampleFormat::I16 => build_output::<i16>(&device, &stream_config, source),
                    SampleFormat::U16 => build_output::<u16>(&device, &stream_config, source),
                    fmt => {
                        return Err(ParleyError::AudioStream(format!(
                            "unsupported output sample format: {fmt:?}"
                        )))
                    }
                }
                .map_err(|e| ParleyError::Device(e.to_string()))?;

                stream
                    .play()
                    .map_err(|e| ParleyError::AudioStream(e.to_string()))?;
                Ok((stream, stream_config.sample_rate.0, stream_config.channels))
            })
        }
    }

    /// Handle to a stream owned by its own thread.
    struct CpalStream {
        sample_rate: u32,
        channels: u16,
        stop_tx: Option<Sender<()>>,
        worker: Option<JoinHandle<()>>,
    }

    impl ActiveStream for CpalStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn close(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    warn!("audio stream thread panicked during shutdown");
                }
            }
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Build a stream on a dedicated thread and block until it is confirmed
    /// playing (or failed). The thread then parks until told to stop.
    fn spawn_stream<F>(name: &str, build: F) -> Result<Box<dyn ActiveStream>>
    where
        F: FnOnce() -> Result<(Stream, u32, u16)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on close() or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("audio stream released");
            })?;

        match ready_rx.recv() {
            Ok(Ok((sample_rate, channels))) => Ok(Box::new(CpalStream {
                sample_rate,
                channels,
                stop_tx: Some(stop_tx),
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(ParleyError::AudioStream(
                    "stream thread exited before reporting".into(),
                ))
            }
        }
    }

    fn select_device(
        host: &cpal::Host,
        preferred: Option<&str>,
        input: bool,
    ) -> Result<cpal::Device> {
        if let Some(preferred_name) = preferred {
            let devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            };
            match devices {
                Ok(mut devices) => {
                    if let Some(device) = devices.find(|d| {
                        d.name().map(|n| n == preferred_name).unwrap_or(false)
                    }) {
                        return Ok(device);
                    }
                    warn!("preferred device '{preferred_name}' not found, falling back");
                }
                Err(e) => warn!("failed to list devices while resolving preference: {e}"),
            }
        }

        if input {
            host.default_input_device()
                .ok_or(ParleyError::NoDefaultInputDevice)
        } else {
            host.default_output_device()
                .ok_or(ParleyError::NoDefaultOutputDevice)
        }
    }

    /// Prefer a native mono config at the wanted rate; otherwise take the
    /// device default and let the capture thread downmix/resample.
    fn choose_input_config(
        device: &cpal::Device,
        wanted_rate: u32,
    ) -> Result<(SampleFormat, StreamConfig)> {
        if let Ok(mut ranges) = device.supported_input_configs() {
            let native = ranges.find(|c| {
                c.channels() == 1
                    && c.min_sample_rate().0 <= wanted_rate
                    && c.max_sample_rate().0 >= wanted_rate
            });
            if let Some(range) = native {
                let supported = range.with_sample_rate(SampleRate(wanted_rate));
                return Ok((supported.sample_format(), supported.config()));
            }
        }

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::Device(e.to_string()))?;
        Ok((supported.sample_format(), supported.config()))
    }

    fn build_input<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = usize::from(config.channels.max(1));
        // Grown once on the first callback, then reused.
        let mut mix: Vec<f32> = Vec::new();

        device.build_input_stream(
            config,
            move |data: &[T], _info| {
                let frames = data.len() / channels;
                mix.resize(frames, 0.0);
                for (slot, frame) in mix.iter_mut().zip(data.chunks_exact(channels)) {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    *slot = sum / channels as f32;
                }
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    warn!("capture ring full: dropped {} samples", mix.len() - written);
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
    }

    fn build_output<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        source: Arc<PlaybackQueue>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(config.channels.max(1));
        let mut mono: Vec<f32> = Vec::new();

        device.build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                source.fill(&mut mono);
                for (frame, sample) in data.chunks_exact_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(*sample);
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
            },
            |err| error!("audio output stream error: {err}"),
            None,
        )
    }

    /// List all available audio input devices on the system.
    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => describe(devices, default_name.as_deref(), "Input"),
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                vec![]
            }
        }
    }

    /// List all available audio output devices on the system.
    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        match host.output_devices() {
            Ok(devices) => describe(devices, default_name.as_deref(), "Output"),
            Err(e) => {
                warn!("failed to enumerate output devices: {e}");
                vec![]
            }
        }
    }

    fn describe(
        devices: impl Iterator<Item = cpal::Device>,
        default_name: Option<&str>,
        label: &str,
    ) -> Vec<DeviceInfo> {
        let mut list = devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("{label} Device {}", idx + 1));
                let is_default = default_name == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect::<Vec<_>>();
        list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
        list
    }
}
