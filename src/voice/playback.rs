//! Audio playback to speakers
//!
//! Speech is piped into an `aplay` process as raw PCM. Sound cues are short
//! WAV files played fire-and-forget on background tasks.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Opens a playback stream for raw s16le mono PCM
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Start a stream at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackHandle>>;
}

/// One running playback
#[async_trait]
pub trait PlaybackHandle: Send {
    /// Queue PCM bytes
    ///
    /// # Errors
    ///
    /// Returns error if the player went away
    async fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Close the input and wait until everything queued has been played
    ///
    /// # Errors
    ///
    /// Returns error if the player fails
    async fn drain(&mut self) -> Result<()>;

    /// Stop immediately
    async fn kill(&mut self);
}

/// Plays PCM through ALSA's `aplay`
pub struct AplaySink {
    binary: PathBuf,
    device: String,
}

impl AplaySink {
    /// # Errors
    ///
    /// Returns error if `aplay` is not installed
    pub fn new(device: &str) -> Result<Self> {
        let binary =
            which::which("aplay").map_err(|e| Error::Audio(format!("aplay not found: {e}")))?;
        Ok(Self {
            binary,
            device: device.to_string(),
        })
    }
}

#[async_trait]
impl PlaybackSink for AplaySink {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackHandle>> {
        let mut child = Command::new(&self.binary)
            .args(["-D", self.device.as_str(), "-f", "S16_LE", "-r"])
            .arg(sample_rate.to_string())
            .args(["-c", "1", "-q"])
            .stdin(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Audio(format!("failed to start aplay: {e}")))?;

        let stdin = child.stdin.take();
        tracing::debug!(sample_rate, device = %self.device, "playback started");
        Ok(Box::new(AplayHandle { child, stdin }))
    }
}

struct AplayHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl PlaybackHandle for AplayHandle {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Audio("playback input closed".to_string()))?;
        stdin
            .write_all(pcm)
            .await
            .map_err(|e| Error::Audio(format!("aplay write failed: {e}")))
    }

    async fn drain(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush().await;
        }
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Audio(format!("aplay exited with {status}")))
        }
    }

    async fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "aplay already gone");
        }
    }
}

/// Software volume boost on s16le PCM
///
/// Keeps an odd trailing byte between chunks so samples split across
/// network chunks are boosted intact.
#[derive(Debug)]
pub struct GainStage {
    boost: f32,
    carry: Option<u8>,
}

impl GainStage {
    #[must_use]
    pub const fn new(boost: f32) -> Self {
        Self { boost, carry: None }
    }

    /// Boost a chunk, returning whole samples only
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(chunk);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }
        apply_gain(&bytes, self.boost)
    }
}

/// Multiply every s16le sample by `boost`, clamping to the i16 range
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn apply_gain(pcm: &[u8], boost: f32) -> Vec<u8> {
    if (boost - 1.0).abs() < f32::EPSILON {
        return pcm.to_vec();
    }
    pcm.chunks_exact(2)
        .flat_map(|pair| {
            let sample = f32::from(i16::from_le_bytes([pair[0], pair[1]]));
            let boosted = (sample * boost).clamp(f32::from(i16::MIN), f32::from(i16::MAX));
            (boosted as i16).to_le_bytes()
        })
        .collect()
}

/// Short status sounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Wake word heard
    Ding,
    /// Waiting on the model
    Thinking,
    /// Something failed, try again
    Retry,
    /// Startup finished
    Ready,
    /// Your turn
    Listening,
}

impl Cue {
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Ding => "ding.wav",
            Self::Thinking => "thinking.wav",
            Self::Retry => "retry.wav",
            Self::Ready => "ready.wav",
            Self::Listening => "listening.wav",
        }
    }
}

/// Plays sound cues without blocking the caller
pub trait CuePlayer: Send + Sync {
    fn play(&self, cue: Cue);

    /// Cut short any cue still playing
    fn stop(&self) {}
}

/// Plays cue WAV files from a directory through `aplay`
pub struct AplayCues {
    binary: PathBuf,
    dir: PathBuf,
    device: String,
    stop: Mutex<CancellationToken>,
}

impl AplayCues {
    /// # Errors
    ///
    /// Returns error if `aplay` is not installed
    pub fn new(dir: PathBuf, device: &str) -> Result<Self> {
        let binary =
            which::which("aplay").map_err(|e| Error::Audio(format!("aplay not found: {e}")))?;
        Ok(Self {
            binary,
            dir,
            device: device.to_string(),
            stop: Mutex::new(CancellationToken::new()),
        })
    }
}

impl CuePlayer for AplayCues {
    fn play(&self, cue: Cue) {
        let path = self.dir.join(cue.file_name());
        if !path.exists() {
            tracing::debug!(path = %path.display(), "sound cue missing");
            return;
        }

        let spawned = Command::new(&self.binary)
            .args(["-D", self.device.as_str(), "-q"])
            .arg(&path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(error = %e, cue = ?cue, "failed to play sound cue");
                return;
            }
        };

        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop.cancelled() => {
                    let _ = child.kill().await;
                    tracing::trace!(cue = ?cue, "sound cue stopped");
                }
                status = child.wait() => {
                    if let Err(e) = status {
                        tracing::debug!(error = %e, cue = ?cue, "sound cue failed");
                    }
                }
            }
        });
    }

    fn stop(&self) {
        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        stop.cancel();
        *stop = CancellationToken::new();
    }
}

/// Cue player that stays silent
pub struct NoCues;

impl CuePlayer for NoCues {
    fn play(&self, cue: Cue) {
        tracing::trace!(cue = ?cue, "sound cue skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_gain_clamps() {
        let out = apply_gain(&pcm(&[100, -100, 20000, -20000]), 5.0);
        assert_eq!(out, pcm(&[500, -500, i16::MAX, i16::MIN]));
    }

    #[test]
    fn test_gain_stage_carries_split_sample() {
        let data = pcm(&[1000, -1000, 300]);
        let mut stage = GainStage::new(2.0);
        let mut out = stage.process(&data[..3]);
        out.extend(stage.process(&data[3..]));
        assert_eq!(out, pcm(&[2000, -2000, 600]));
    }

    #[test]
    fn test_unity_gain_is_passthrough() {
        let data = pcm(&[1, 2, 3]);
        assert_eq!(apply_gain(&data, 1.0), data);
    }

    #[test]
    fn test_cue_player_resolves_aplay() {
        let dir = tempfile::tempdir().unwrap();
        let cues = AplayCues::new(dir.path().to_path_buf(), "default");
        assert_eq!(cues.is_ok(), which::which("aplay").is_ok());
    }

    #[test]
    fn test_stop_rearms_for_next_cue() {
        let dir = tempfile::tempdir().unwrap();
        let Ok(cues) = AplayCues::new(dir.path().to_path_buf(), "default") else {
            return;
        };
        let running = cues.stop.lock().unwrap().clone();

        cues.stop();

        assert!(running.is_cancelled());
        assert!(!cues.stop.lock().unwrap().is_cancelled());
    }

    #[test]
    fn test_cue_files() {
        assert_eq!(Cue::Ding.file_name(), "ding.wav");
        assert_eq!(Cue::Listening.file_name(), "listening.wav");
    }
}
