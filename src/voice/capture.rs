//! Audio capture from microphone

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SampleRate, SizedSample, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// A source of mono f32 audio at a fixed sample rate
///
/// `read` never blocks: it drains whatever has arrived since the last call.
pub trait MicSource: Send {
    /// Open the device and begin buffering
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start(&mut self) -> Result<()>;

    /// Close the device
    fn stop(&mut self);

    /// Drain buffered samples
    fn read(&mut self) -> Vec<f32>;

    /// Discard buffered samples
    fn clear(&mut self);

    /// Sample rate of the returned audio
    fn sample_rate(&self) -> u32;
}

/// Captures audio from the default input device
///
/// The cpal stream is owned by a dedicated thread so the handle itself can
/// move between tasks.
pub struct CpalMic {
    buffer: Arc<Mutex<Vec<f32>>>,
    worker: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl CpalMic {
    /// Create a new capture handle; the device is opened on `start`
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Default for CpalMic {
    fn default() -> Self {
        Self::new()
    }
}

impl MicSource for CpalMic {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("mic".to_string())
            .spawn(move || {
                let stream = match open_input_stream(buffer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream open until stop() or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some((stop_tx, handle));
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Audio("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.worker.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
            tracing::debug!("audio capture stopped");
        }
    }

    fn read(&mut self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl Drop for CpalMic {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default input at 16kHz, downmixing to mono in the callback
fn open_input_stream(buffer: Arc<Mutex<Vec<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
    };

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            // Fallback: multi-channel mic, downmixed in the callback
            device
                .supported_input_configs()
                .ok()?
                .find(|c| supports_rate(c))
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let format = supported_config.sample_format();
    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        format = ?format,
        "audio capture initialized"
    );

    let stream = match format {
        SampleFormat::I16 => build_input::<i16>(&device, &config, buffer)?,
        _ => build_input::<f32>(&device, &config, buffer)?,
    };

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / channels as f32;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.chunks_exact(channels).map(|frame| {
                        frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() * scale
                    }));
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Records a fixed stretch of audio without voice activity detection
///
/// Used when the regular microphone keeps failing, so implementations must
/// not share its device handle.
#[async_trait]
pub trait FixedRecorder: Send + Sync {
    /// Record `duration` of mono 16-bit audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the recorder fails or shutdown interrupts it
    async fn record(
        &self,
        duration: Duration,
        sample_rate: u32,
        shutdown: &CancellationToken,
    ) -> Result<Vec<i16>>;
}

/// Records through ALSA's `arecord`, independent of the cpal stream
pub struct ArecordRecorder {
    binary: PathBuf,
    device: String,
}

impl ArecordRecorder {
    /// # Errors
    ///
    /// Returns error if `arecord` is not installed
    pub fn new(device: &str) -> Result<Self> {
        let binary = which::which("arecord")
            .map_err(|e| Error::Audio(format!("arecord not found: {e}")))?;
        Ok(Self {
            binary,
            device: device.to_string(),
        })
    }
}

#[async_trait]
impl FixedRecorder for ArecordRecorder {
    async fn record(
        &self,
        duration: Duration,
        sample_rate: u32,
        shutdown: &CancellationToken,
    ) -> Result<Vec<i16>> {
        // arecord only takes whole seconds; the surplus is cut below
        let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
        let child = Command::new(&self.binary)
            .args(["-q", "-D", self.device.as_str(), "-f", "S16_LE", "-c", "1", "-t", "raw"])
            .arg("-r")
            .arg(sample_rate.to_string())
            .arg("-d")
            .arg(secs.max(1).to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Audio(format!("failed to start arecord: {e}")))?;

        tracing::debug!(device = %self.device, secs, "arecord started");
        let output = tokio::select! {
            () = shutdown.cancelled() => {
                return Err(Error::Audio("arecord cancelled by shutdown".to_string()));
            }
            output = child.wait_with_output() => output?,
        };
        if !output.status.success() {
            return Err(Error::Audio(format!("arecord exited with {}", output.status)));
        }

        let mut samples = pcm_from_le_bytes(&output.stdout);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wanted = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        samples.truncate(wanted);
        Ok(samples)
    }
}

/// Decode raw s16le bytes; a trailing odd byte is dropped
#[must_use]
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert a float sample in [-1.0, 1.0] to 16-bit PCM
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Encode 16-bit samples as mono WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s)).collect();
    pcm_to_wav(&pcm, sample_rate)
}

/// Write the WAV artifact, creating parent directories as needed
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_wav_file(path: &Path, wav: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, wav)?;
    Ok(())
}
