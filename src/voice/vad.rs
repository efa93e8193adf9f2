//! Voice activity detection and utterance capture
//!
//! Audio is re-chunked into 30ms frames, each classified as speech or
//! silence. All timing is derived from sample counts, so the hard cap on
//! recording length holds no matter how the task is scheduled.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::capture::{FixedRecorder, MicSource, f32_to_i16, pcm_to_wav, write_wav_file};
use crate::config::{VadBackend, VoiceConfig};

/// VAD frame length in milliseconds (WebRTC accepts 10, 20 or 30)
pub const FRAME_MS: u32 = 30;

/// Extra wall-clock time allowed before a silent mic counts as stalled
const STALL_GRACE: Duration = Duration::from_secs(2);

/// Mic polling interval
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Samples per VAD frame at `sample_rate`
#[must_use]
pub const fn frame_len(sample_rate: u32) -> usize {
    (sample_rate * FRAME_MS / 1000) as usize
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

/// Classifies one frame of 16-bit audio as speech or not
pub trait VoiceActivity: Send {
    fn is_speech(&mut self, frame: &[i16]) -> bool;
}

/// WebRTC voice activity detector
///
/// The underlying detector is not thread-safe, so one is built per frame.
pub struct WebRtcVad {
    mode: u8,
    sample_rate: u32,
}

impl WebRtcVad {
    #[must_use]
    pub const fn new(mode: u8, sample_rate: u32) -> Self {
        Self { mode, sample_rate }
    }
}

impl VoiceActivity for WebRtcVad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        use webrtc_vad::{SampleRate, Vad, VadMode};

        let mut vad = Vad::new();
        vad.set_mode(match self.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        });
        let rate = match self.sample_rate {
            8000 => SampleRate::Rate8kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => SampleRate::Rate16kHz,
        };
        let _ = vad.set_sample_rate(rate);

        match vad.is_voice_segment(frame) {
            Ok(speech) => speech,
            Err(e) => {
                tracing::warn!(error = ?e, len = frame.len(), "VAD rejected frame");
                false
            }
        }
    }
}

/// RMS energy threshold detector
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VoiceActivity for EnergyVad {
    #[allow(clippy::cast_precision_loss)]
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let sum: f32 = frame
            .iter()
            .map(|&s| {
                let v = f32::from(s) / 32768.0;
                v * v
            })
            .sum();
        (sum / frame.len() as f32).sqrt() > self.threshold
    }
}

/// Build the configured detector
#[must_use]
pub fn build_vad(config: &VoiceConfig, sample_rate: u32) -> Box<dyn VoiceActivity> {
    match config.vad {
        VadBackend::WebRtc => Box::new(WebRtcVad::new(config.vad_mode, sample_rate)),
        VadBackend::Energy => Box::new(EnergyVad::new(config.energy_threshold)),
    }
}

/// Duration bounds for one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Hard cap, always enforced
    pub max_duration: Duration,
    /// Silence cannot end the recording before this
    pub min_duration: Duration,
    /// Trailing silence that ends the recording
    pub silence_threshold: Duration,
}

impl From<&VoiceConfig> for CaptureLimits {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            max_duration: config.max_record,
            min_duration: config.min_record,
            silence_threshold: config.silence_threshold,
        }
    }
}

/// Why the gate ended a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Silence,
    MaxDuration,
}

/// Per-frame decision of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Stop(StopReason),
}

/// Decides when an utterance has ended from a sequence of VAD verdicts
#[derive(Debug, Clone)]
pub struct VadGate {
    frame_samples: usize,
    max_samples: usize,
    min_samples: usize,
    silence_samples: usize,
    recorded: usize,
    trailing_silence: usize,
    heard_speech: bool,
}

impl VadGate {
    #[must_use]
    pub fn new(limits: CaptureLimits, sample_rate: u32) -> Self {
        Self {
            frame_samples: frame_len(sample_rate),
            max_samples: samples_for(limits.max_duration, sample_rate),
            min_samples: samples_for(limits.min_duration, sample_rate),
            silence_samples: samples_for(limits.silence_threshold, sample_rate),
            recorded: 0,
            trailing_silence: 0,
            heard_speech: false,
        }
    }

    /// Feed the verdict for the next frame
    pub fn push(&mut self, is_speech: bool) -> GateDecision {
        self.recorded += self.frame_samples;
        if is_speech {
            self.trailing_silence = 0;
            self.heard_speech = true;
        } else {
            self.trailing_silence += self.frame_samples;
        }

        if self.recorded >= self.max_samples {
            GateDecision::Stop(StopReason::MaxDuration)
        } else if self.recorded >= self.min_samples && self.trailing_silence >= self.silence_samples
        {
            GateDecision::Stop(StopReason::Silence)
        } else {
            GateDecision::Continue
        }
    }

    /// Number of samples the recording may hold
    #[must_use]
    pub const fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Whether any frame was classified as speech
    #[must_use]
    pub const fn heard_speech(&self) -> bool {
        self.heard_speech
    }
}

/// Why a capture produced no utterance
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Less audio than the minimum viable length
    #[error("recording too short ({0:?})")]
    TooShort(Duration),

    /// The microphone failed, and so did the fixed-duration fallback
    #[error("audio device error: {0}")]
    Device(String),

    /// Shutdown requested mid-capture
    #[error("capture cancelled by shutdown")]
    Shutdown,
}

/// A captured utterance and its WAV artifact
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Mono 16-bit WAV encoding of `samples`
    pub wav: Vec<u8>,
    /// Where the WAV artifact was written
    pub path: PathBuf,
}

impl Utterance {
    #[must_use]
    pub fn duration(&self) -> Duration {
        duration_of(self.samples.len(), self.sample_rate)
    }
}

#[allow(clippy::cast_precision_loss)]
fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate.max(1)))
}

/// Records VAD-gated utterances from a microphone
pub struct UtteranceRecorder {
    mic: Box<dyn MicSource>,
    fallback: Option<Box<dyn FixedRecorder>>,
    config: VoiceConfig,
    stall_grace: Duration,
}

impl UtteranceRecorder {
    #[must_use]
    pub fn new(mic: Box<dyn MicSource>, config: &VoiceConfig) -> Self {
        Self {
            mic,
            fallback: None,
            config: config.clone(),
            stall_grace: STALL_GRACE,
        }
    }

    /// Take degraded recordings with `recorder` instead of the microphone
    #[must_use]
    pub fn with_fallback(mut self, recorder: Box<dyn FixedRecorder>) -> Self {
        self.fallback = Some(recorder);
        self
    }

    /// Override how long a silent microphone is tolerated past the target length
    #[must_use]
    pub const fn with_stall_grace(mut self, grace: Duration) -> Self {
        self.stall_grace = grace;
        self
    }

    /// Record one utterance
    ///
    /// Device failures and too-short recordings are retried; when every VAD
    /// attempt fails a fixed-duration recording without VAD is taken
    /// instead, through the fallback recorder when one is set.
    ///
    /// # Errors
    ///
    /// Returns `TooShort` below the minimum viable length, `Device` when even
    /// the degraded recording fails, and `Shutdown` when cancelled.
    pub async fn capture(
        &mut self,
        limits: CaptureLimits,
        shutdown: &CancellationToken,
    ) -> Result<Utterance, CaptureError> {
        let rate = self.mic.sample_rate();
        let attempts = self.config.capture_retries.max(1);

        for attempt in 1..=attempts {
            let mut vad = build_vad(&self.config, rate);
            let mut gate = VadGate::new(limits, rate);
            let max_samples = gate.max_samples();
            let mut reason = None;

            let result = self
                .pump(shutdown, limits.max_duration, |frame| {
                    match gate.push(vad.is_speech(frame)) {
                        GateDecision::Continue => false,
                        GateDecision::Stop(r) => {
                            reason = Some(r);
                            true
                        }
                    }
                })
                .await
                .and_then(|mut samples| {
                    samples.truncate(max_samples);
                    tracing::debug!(
                        reason = ?reason,
                        heard_speech = gate.heard_speech(),
                        samples = samples.len(),
                        "recording stopped"
                    );
                    self.finish(samples, rate)
                });

            match result {
                Ok(utterance) => return Ok(utterance),
                Err(e @ (CaptureError::Device(_) | CaptureError::TooShort(_))) => {
                    tracing::warn!(attempt, attempts, error = %e, "capture failed");
                    if attempt < attempts {
                        tokio::select! {
                            () = shutdown.cancelled() => return Err(CaptureError::Shutdown),
                            () = tokio::time::sleep(self.config.retry_delay) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.record_degraded(rate, shutdown).await
    }

    async fn record_degraded(
        &mut self,
        rate: u32,
        shutdown: &CancellationToken,
    ) -> Result<Utterance, CaptureError> {
        let duration = self.config.fallback_record;

        let samples = if let Some(recorder) = &self.fallback {
            tracing::warn!(?duration, "falling back to fixed-duration recording");
            recorder
                .record(duration, rate, shutdown)
                .await
                .map_err(|e| {
                    if shutdown.is_cancelled() {
                        CaptureError::Shutdown
                    } else {
                        CaptureError::Device(e.to_string())
                    }
                })?
        } else {
            tracing::warn!(?duration, "falling back to fixed-duration recording on the microphone");
            let target = samples_for(duration, rate);
            let mut seen = 0;
            self.pump(shutdown, duration, |frame| {
                seen += frame.len();
                seen >= target
            })
            .await?
        };
        self.finish(samples, rate)
    }

    /// Wait for the user to keep talking without a wake word
    ///
    /// Returns true once enough consecutive speech frames arrive within
    /// `window`, false on timeout, device failure or shutdown.
    pub async fn listen_for_follow_up(
        &mut self,
        window: Duration,
        frames_needed: usize,
        shutdown: &CancellationToken,
    ) -> bool {
        let rate = self.mic.sample_rate();
        let target = samples_for(window, rate);
        let mut vad = build_vad(&self.config, rate);
        let mut seen = 0;
        let mut consecutive = 0;
        let mut detected = false;

        let result = self
            .pump(shutdown, window, |frame| {
                seen += frame.len();
                if vad.is_speech(frame) {
                    consecutive += 1;
                } else {
                    consecutive = 0;
                }
                if consecutive >= frames_needed.max(1) {
                    detected = true;
                    return true;
                }
                seen >= target
            })
            .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, "follow-up listening ended");
        }
        tracing::debug!(detected, "follow-up window closed");
        detected
    }

    /// Read frames until `on_frame` asks to stop
    ///
    /// Returns everything recorded, including the frame that stopped it.
    async fn pump<F>(
        &mut self,
        shutdown: &CancellationToken,
        expected: Duration,
        mut on_frame: F,
    ) -> Result<Vec<i16>, CaptureError>
    where
        F: FnMut(&[i16]) -> bool + Send,
    {
        self.mic.clear();
        self.mic
            .start()
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let frame_samples = frame_len(self.mic.sample_rate());
        let wall_limit = expected + self.stall_grace;
        let started = tokio::time::Instant::now();
        let mut pending: Vec<i16> = Vec::new();
        let mut recorded: Vec<i16> = Vec::new();

        let result = loop {
            if shutdown.is_cancelled() {
                break Err(CaptureError::Shutdown);
            }

            pending.extend(self.mic.read().into_iter().map(f32_to_i16));
            let mut stop = false;
            while pending.len() >= frame_samples {
                let frame: Vec<i16> = pending.drain(..frame_samples).collect();
                recorded.extend_from_slice(&frame);
                if on_frame(&frame) {
                    stop = true;
                    break;
                }
            }
            if stop {
                break Ok(recorded);
            }

            if started.elapsed() > wall_limit {
                if recorded.is_empty() {
                    break Err(CaptureError::Device(
                        "microphone delivered no audio".to_string(),
                    ));
                }
                tracing::warn!(samples = recorded.len(), "microphone stalled mid-recording");
                break Ok(recorded);
            }

            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        self.mic.stop();
        result
    }

    fn finish(&self, samples: Vec<i16>, sample_rate: u32) -> Result<Utterance, CaptureError> {
        let duration = duration_of(samples.len(), sample_rate);
        if duration < self.config.min_viable {
            tracing::warn!(?duration, "recording below minimum viable length");
            return Err(CaptureError::TooShort(duration));
        }

        let wav = pcm_to_wav(&samples, sample_rate)
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        write_wav_file(&self.config.recording_path, &wav)
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        tracing::info!(?duration, path = %self.config.recording_path.display(), "utterance captured");
        Ok(Utterance {
            samples,
            sample_rate,
            wav,
            path: self.config.recording_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::Result;
    use crate::config::Config;

    const RATE: u32 = 16000;

    struct TestMic {
        chunks: VecDeque<Vec<f32>>,
        fail_start: bool,
    }

    impl TestMic {
        fn new(script: &[(f32, f64)]) -> Self {
            let mut chunks = VecDeque::new();
            for &(level, secs) in script {
                let n = samples_for(Duration::from_secs_f64(secs), RATE);
                for block in vec![level; n].chunks(1600) {
                    chunks.push_back(block.to_vec());
                }
            }
            Self {
                chunks,
                fail_start: false,
            }
        }
    }

    impl MicSource for TestMic {
        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                Err(crate::Error::Audio("device busy".to_string()))
            } else {
                Ok(())
            }
        }
        fn stop(&mut self) {}
        fn read(&mut self) -> Vec<f32> {
            self.chunks.pop_front().unwrap_or_default()
        }
        fn clear(&mut self) {}
        fn sample_rate(&self) -> u32 {
            RATE
        }
    }

    struct CannedRecorder {
        seconds: f64,
        calls: Arc<AtomicUsize>,
    }

    impl CannedRecorder {
        fn new(seconds: f64) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let recorder = Self {
                seconds,
                calls: Arc::clone(&calls),
            };
            (recorder, calls)
        }
    }

    #[async_trait]
    impl FixedRecorder for CannedRecorder {
        async fn record(
            &self,
            _duration: Duration,
            sample_rate: u32,
            _shutdown: &CancellationToken,
        ) -> Result<Vec<i16>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![5000; samples_for(Duration::from_secs_f64(self.seconds), sample_rate)])
        }
    }

    fn voice_config(dir: &std::path::Path) -> VoiceConfig {
        let mut config = Config::with_data_dir(dir.to_path_buf()).voice;
        config.vad = VadBackend::Energy;
        config.retry_delay = Duration::ZERO;
        config
    }

    fn limits(max: f64, min: f64, silence: f64) -> CaptureLimits {
        CaptureLimits {
            max_duration: Duration::from_secs_f64(max),
            min_duration: Duration::from_secs_f64(min),
            silence_threshold: Duration::from_secs_f64(silence),
        }
    }

    #[test]
    fn test_gate_hard_cap() {
        let mut gate = VadGate::new(limits(1.0, 0.5, 0.3), RATE);
        let mut frames = 0;
        while gate.push(true) == GateDecision::Continue {
            frames += 1;
        }
        assert!((frames + 1) * frame_len(RATE) >= gate.max_samples());
        assert!(frames * frame_len(RATE) < gate.max_samples());
    }

    #[test]
    fn test_gate_silence_waits_for_min_duration() {
        let mut gate = VadGate::new(limits(8.0, 0.5, 0.09), RATE);
        // 0.09s of silence is reached after 3 frames, but min is ~17 frames
        for _ in 0..10 {
            assert_eq!(gate.push(false), GateDecision::Continue);
        }
        let mut decision = GateDecision::Continue;
        for _ in 0..10 {
            decision = gate.push(false);
            if decision != GateDecision::Continue {
                break;
            }
        }
        assert_eq!(decision, GateDecision::Stop(StopReason::Silence));
    }

    #[test]
    fn test_gate_speech_resets_silence() {
        let mut gate = VadGate::new(limits(8.0, 0.0, 0.09), RATE);
        assert_eq!(gate.push(false), GateDecision::Continue);
        assert_eq!(gate.push(false), GateDecision::Continue);
        assert_eq!(gate.push(true), GateDecision::Continue);
        assert_eq!(gate.push(false), GateDecision::Continue);
        assert_eq!(gate.push(false), GateDecision::Continue);
        assert_eq!(gate.push(false), GateDecision::Stop(StopReason::Silence));
        assert!(gate.heard_speech());
    }

    #[test]
    fn test_energy_vad() {
        let mut vad = EnergyVad::new(0.03);
        assert!(!vad.is_speech(&[0; 480]));
        assert!(vad.is_speech(&[10_000; 480]));
    }

    #[tokio::test]
    async fn test_capture_stops_on_trailing_silence() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.3, 1.0), (0.0, 3.0)]);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));

        let utterance = recorder
            .capture(limits(8.0, 0.5, 1.5), &CancellationToken::new())
            .await
            .unwrap();

        let secs = utterance.duration().as_secs_f64();
        assert!(secs >= 2.5 && secs < 2.6, "duration {secs}");
        assert!(utterance.path.exists());
    }

    #[tokio::test]
    async fn test_capture_never_exceeds_max() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.3, 5.0)]);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));

        let utterance = recorder
            .capture(limits(2.0, 0.5, 1.5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(utterance.samples.len(), 32000);
    }

    #[tokio::test]
    async fn test_too_short_when_fallback_is_short_too() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.3, 0.1)]);
        let (fallback, calls) = CannedRecorder::new(0.1);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()))
            .with_stall_grace(Duration::from_millis(20))
            .with_fallback(Box::new(fallback));

        let result = recorder
            .capture(limits(0.2, 0.1, 0.1), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CaptureError::TooShort(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_too_short_recording_is_retried_then_recorded_by_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.3, 0.1)]);
        let (fallback, calls) = CannedRecorder::new(1.0);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()))
            .with_stall_grace(Duration::from_millis(20))
            .with_fallback(Box::new(fallback));

        let utterance = recorder
            .capture(limits(0.2, 0.1, 0.1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(utterance.samples.len(), 16000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(utterance.path.exists());
    }

    #[tokio::test]
    async fn test_failed_mic_falls_back_to_independent_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let mut mic = TestMic::new(&[]);
        mic.fail_start = true;
        let (fallback, calls) = CannedRecorder::new(1.0);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()))
            .with_fallback(Box::new(fallback));

        let utterance = recorder
            .capture(limits(1.0, 0.5, 0.5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(utterance.duration(), Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_failure_after_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut mic = TestMic::new(&[]);
        mic.fail_start = true;
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));

        let result = recorder
            .capture(limits(1.0, 0.5, 0.5), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CaptureError::Device(_))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.3, 1.0)]);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = recorder.capture(limits(8.0, 0.5, 1.5), &shutdown).await;
        assert!(matches!(result, Err(CaptureError::Shutdown)));
    }

    #[tokio::test]
    async fn test_follow_up_detects_speech() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.0, 0.5), (0.3, 0.5)]);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));

        assert!(
            recorder
                .listen_for_follow_up(Duration::from_secs(3), 6, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_follow_up_times_out_on_silence() {
        let dir = tempfile::tempdir().unwrap();
        let mic = TestMic::new(&[(0.0, 1.0)]);
        let mut recorder = UtteranceRecorder::new(Box::new(mic), &voice_config(dir.path()));

        assert!(
            !recorder
                .listen_for_follow_up(Duration::from_millis(500), 6, &CancellationToken::new())
                .await
        );
    }
}
