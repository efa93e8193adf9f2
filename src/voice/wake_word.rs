//! Wake word detection
//!
//! The default spotter scores fixed frames against a rustpotter keyword
//! model, so a detection lands within one frame of the phrase ending even
//! while the speaker is playing. Without a model, short speech bursts are
//! segmented by energy, transcribed, and fuzzily matched against the
//! configured wake phrases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};
use strsim::{jaro_winkler, levenshtein};
use tokio_util::sync::CancellationToken;

use super::capture::{MicSource, calculate_rms, samples_to_wav};
use super::stt::Transcriber;
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Minimum duration of speech to trigger (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration to consider end of utterance (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Segments longer than this are evaluated without waiting for silence
const MAX_SEGMENT_SAMPLES: usize = 48000; // 3 seconds

/// Mic polling interval while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Builds a fresh detector, e.g. one per playback for the interrupt listener
pub type DetectorFactory = Arc<dyn Fn() -> Result<WakeWordDetector> + Send + Sync>;

/// Recognizes a wake phrase in streamed audio
#[async_trait]
pub trait KeywordSpotter: Send {
    /// Feed samples; returns true once the wake phrase was heard
    ///
    /// # Errors
    ///
    /// Returns error if the underlying recognizer fails
    async fn process(&mut self, samples: &[f32]) -> Result<bool>;

    /// Forget any partially heard audio
    fn reset(&mut self);
}

/// Fuzzy wake phrase matching on transcribed text
#[derive(Debug, Clone)]
pub struct WakeMatcher {
    phrases: Vec<Vec<String>>,
    max_distance: usize,
    similarity: f64,
}

impl WakeMatcher {
    #[must_use]
    pub fn new(phrases: &[String], max_distance: usize, similarity: f64) -> Self {
        let phrases = phrases
            .iter()
            .map(|p| {
                normalize(p)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|tokens| !tokens.is_empty())
            .collect();
        Self {
            phrases,
            max_distance,
            similarity,
        }
    }

    #[must_use]
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self::new(
            &config.wake_phrases,
            config.wake_max_distance,
            config.wake_similarity,
        )
    }

    /// Whether any wake phrase occurs anywhere in `text`
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let norm = normalize(text);
        let tokens: Vec<&str> = norm.split_whitespace().collect();

        self.phrases.iter().any(|phrase| {
            tokens.len() >= phrase.len()
                && tokens.windows(phrase.len()).any(|window| {
                    window
                        .iter()
                        .zip(phrase)
                        .all(|(t, p)| self.token_matches(t, p))
                })
        })
    }

    fn token_matches(&self, heard: &str, expected: &str) -> bool {
        if heard == expected {
            return true;
        }
        // Fuzzy matching on very short words produces too many false hits
        if expected.chars().count() <= 3 {
            return false;
        }
        levenshtein(heard, expected) <= self.max_distance
            || jaro_winkler(heard, expected) >= self.similarity
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scores fixed-size audio frames against a keyword model
pub trait KeywordModel: Send {
    /// Samples per scored frame
    fn samples_per_frame(&self) -> usize;

    /// Score one frame; true when the keyword was heard
    fn detect(&mut self, frame: &[f32]) -> bool;
}

/// Rustpotter `.rpw` wake word model
pub struct RustpotterModel {
    detector: Rustpotter,
}

impl RustpotterModel {
    /// Load a model file for mono f32 audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or not a valid model
    pub fn from_file(path: &Path, threshold: f32, sample_rate: u32) -> Result<Self> {
        let model_path = path
            .to_str()
            .ok_or_else(|| Error::WakeWord(format!("invalid model path: {}", path.display())))?;

        let mut config = RustpotterConfig::default();
        config.fmt.sample_rate = usize::try_from(sample_rate)
            .map_err(|e| Error::WakeWord(e.to_string()))?;
        config.fmt.channels = 1;
        config.fmt.sample_format = SampleFormat::F32;
        config.detector.threshold = threshold;

        let mut detector = Rustpotter::new(&config).map_err(|e| Error::WakeWord(e.to_string()))?;
        detector
            .add_wakeword_from_file("wake", model_path)
            .map_err(|e| Error::WakeWord(format!("{}: {e}", path.display())))?;

        tracing::debug!(model = %path.display(), threshold, "wake word model loaded");
        Ok(Self { detector })
    }
}

impl KeywordModel for RustpotterModel {
    fn samples_per_frame(&self) -> usize {
        self.detector.get_samples_per_frame()
    }

    fn detect(&mut self, frame: &[f32]) -> bool {
        self.detector.process_samples(frame.to_vec()).is_some()
    }
}

/// Keyword spotter feeding whole frames to a [`KeywordModel`]
pub struct ModelSpotter<M> {
    model: M,
    pending: Vec<f32>,
}

impl<M: KeywordModel> ModelSpotter<M> {
    #[must_use]
    pub const fn new(model: M) -> Self {
        Self {
            model,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl<M: KeywordModel> KeywordSpotter for ModelSpotter<M> {
    async fn process(&mut self, samples: &[f32]) -> Result<bool> {
        self.pending.extend_from_slice(samples);
        let frame = self.model.samples_per_frame().max(1);

        let mut offset = 0;
        while self.pending.len() - offset >= frame {
            let detected = self.model.detect(&self.pending[offset..offset + frame]);
            offset += frame;
            if detected {
                tracing::info!("wake word detected");
                self.pending.clear();
                return Ok(true);
            }
        }
        self.pending.drain(..offset);
        Ok(false)
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Spotter for the configured wake word
///
/// Uses the keyword model when it loads, otherwise transcript matching.
#[must_use]
pub fn build_spotter(
    config: &VoiceConfig,
    transcriber: &Arc<dyn Transcriber>,
    sample_rate: u32,
) -> Box<dyn KeywordSpotter> {
    match RustpotterModel::from_file(&config.wake_model, config.wake_threshold, sample_rate) {
        Ok(model) => Box::new(ModelSpotter::new(model)),
        Err(e) => {
            tracing::debug!(error = %e, "no wake word model, matching transcripts");
            Box::new(TranscriptSpotter::new(
                Arc::clone(transcriber),
                WakeMatcher::from_config(config),
                config.energy_threshold,
                sample_rate,
            ))
        }
    }
}

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// Keyword spotter built on an STT backend
pub struct TranscriptSpotter {
    transcriber: Arc<dyn Transcriber>,
    matcher: WakeMatcher,
    energy_threshold: f32,
    sample_rate: u32,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    silence_counter: usize,
}

impl TranscriptSpotter {
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        matcher: WakeMatcher,
        energy_threshold: f32,
        sample_rate: u32,
    ) -> Self {
        Self {
            transcriber,
            matcher,
            energy_threshold,
            sample_rate,
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Track speech activity; returns true when a segment is complete
    fn segment(&mut self, samples: &[f32]) -> bool {
        let energy = calculate_rms(samples);
        let is_speech = energy > self.energy_threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
                false
            }
            DetectorState::Listening => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.speech_buffer.len() >= MAX_SEGMENT_SAMPLES
                    || (self.silence_counter > SILENCE_SAMPLES
                        && self.speech_buffer.len() > MIN_SPEECH_SAMPLES)
                {
                    tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                    return true;
                }

                // Too much silence without enough speech
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    tracing::trace!("timeout - resetting");
                    self.reset();
                }
                false
            }
        }
    }
}

#[async_trait]
impl KeywordSpotter for TranscriptSpotter {
    async fn process(&mut self, samples: &[f32]) -> Result<bool> {
        if !self.segment(samples) {
            return Ok(false);
        }

        let segment = std::mem::take(&mut self.speech_buffer);
        self.reset();

        let wav = samples_to_wav(&segment, self.sample_rate)?;
        let transcript = self.transcriber.transcribe(&wav).await?;
        let detected = self.matcher.matches(&transcript);
        if detected {
            tracing::info!(transcript = %transcript, "wake word detected");
        } else {
            tracing::debug!(transcript = %transcript, "no wake word in segment");
        }
        Ok(detected)
    }

    fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.silence_counter = 0;
    }
}

/// Waits for the wake word on a microphone
///
/// The mic stays open between timed-out waits so a phrase spoken across
/// two short polls is still heard. Call [`WakeWordDetector::disarm`] before
/// something else needs the microphone.
pub struct WakeWordDetector {
    mic: Box<dyn MicSource>,
    spotter: Box<dyn KeywordSpotter>,
    armed: bool,
}

impl WakeWordDetector {
    #[must_use]
    pub fn new(mic: Box<dyn MicSource>, spotter: Box<dyn KeywordSpotter>) -> Self {
        Self {
            mic,
            spotter,
            armed: false,
        }
    }

    /// Listen until the wake word, the timeout, or shutdown
    ///
    /// Returns true only on detection. Mic and spotter errors are logged and
    /// treated as "not detected".
    pub async fn wait(&mut self, timeout: Option<Duration>, shutdown: &CancellationToken) -> bool {
        if !self.armed {
            self.spotter.reset();
            self.mic.clear();
            if let Err(e) = self.mic.start() {
                tracing::warn!(error = %e, "wake word mic unavailable");
                return false;
            }
            self.armed = true;
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let detected = loop {
            if shutdown.is_cancelled() {
                break false;
            }

            let samples = self.mic.read();
            if !samples.is_empty() {
                match self.spotter.process(&samples).await {
                    Ok(true) => break true,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "wake word check failed"),
                }
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                break false;
            }

            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        if detected || shutdown.is_cancelled() {
            self.disarm();
        }
        detected
    }

    /// Close the mic and drop any partially heard audio
    pub fn disarm(&mut self) {
        if self.armed {
            self.mic.stop();
            self.spotter.reset();
            self.armed = false;
        }
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.disarm();
    }
}
