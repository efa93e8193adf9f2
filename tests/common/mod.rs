//! Shared test fakes

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;

use picar_jarvis::config::{Config, VadBackend};
use picar_jarvis::dialogue::{ChatMessage, ChatModel, TokenStream};
use picar_jarvis::hardware::{Actuator, Sensors};
use picar_jarvis::voice::tts::SpeechAudio;
use picar_jarvis::voice::{
    Cue, CuePlayer, KeywordSpotter, MicSource, PlaybackHandle, PlaybackSink, SAMPLE_RATE,
    Speaker, Synthesizer, Transcriber, WakeMatcher,
};
use picar_jarvis::{Error, Result};

/// Config tuned for fast, hardware-free tests rooted at `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_data_dir(dir.to_path_buf());
    config.voice.vad = VadBackend::Energy;
    config.voice.retry_delay = Duration::ZERO;
    config.voice.max_record = Duration::from_secs(2);
    config.voice.min_record = Duration::from_millis(300);
    config.voice.silence_threshold = Duration::from_millis(300);
    config.voice.fallback_record = Duration::from_millis(500);
    config.stt.retries = 1;
    config.stt.retry_delay = Duration::ZERO;
    config.llm.retries = 1;
    config.llm.retry_delay = Duration::ZERO;
    config.exploration.enabled = false;
    config.control.action_time_scale = 0.0;
    config
}

#[derive(Default)]
struct MicState {
    chunks: VecDeque<Vec<f32>>,
    endless: Option<f32>,
    fail_start: bool,
    starts: usize,
    stops: usize,
}

/// Microphone replaying scripted levels in 0.1 s chunks
#[derive(Clone, Default)]
pub struct ScriptedMic(Arc<Mutex<MicState>>);

impl ScriptedMic {
    /// `(level, seconds)` pairs played in order, then silence forever after
    pub fn script(parts: &[(f32, f64)]) -> Self {
        let mic = Self::default();
        mic.push(parts);
        mic
    }

    /// The same level forever
    pub fn endless(level: f32) -> Self {
        let mic = Self::default();
        mic.0.lock().unwrap().endless = Some(level);
        mic
    }

    /// A microphone that cannot be opened
    pub fn broken() -> Self {
        let mic = Self::default();
        mic.0.lock().unwrap().fail_start = true;
        mic
    }

    pub fn push(&self, parts: &[(f32, f64)]) {
        let mut state = self.0.lock().unwrap();
        for &(level, secs) in parts {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n = (secs * f64::from(SAMPLE_RATE)).round() as usize;
            for block in vec![level; n].chunks(1600) {
                state.chunks.push_back(block.to_vec());
            }
        }
    }

    pub fn starts(&self) -> usize {
        self.0.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.0.lock().unwrap().stops
    }
}

impl MicSource for ScriptedMic {
    fn start(&mut self) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.fail_start {
            return Err(Error::Audio("device busy".to_string()));
        }
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().stops += 1;
    }

    fn read(&mut self) -> Vec<f32> {
        let mut state = self.0.lock().unwrap();
        match state.chunks.pop_front() {
            Some(chunk) => chunk,
            None => state.endless.map(|level| vec![level; 1600]).unwrap_or_default(),
        }
    }

    fn clear(&mut self) {}

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Spotter that fires after a fixed number of non-empty chunks
pub struct ScriptedSpotter {
    fire_after: Option<usize>,
    seen: usize,
}

impl ScriptedSpotter {
    pub const fn always() -> Self {
        Self {
            fire_after: Some(1),
            seen: 0,
        }
    }

    pub const fn never() -> Self {
        Self {
            fire_after: None,
            seen: 0,
        }
    }

    pub const fn after(chunks: usize) -> Self {
        Self {
            fire_after: Some(chunks),
            seen: 0,
        }
    }
}

#[async_trait]
impl KeywordSpotter for ScriptedSpotter {
    async fn process(&mut self, _samples: &[f32]) -> Result<bool> {
        self.seen += 1;
        Ok(self.fire_after.is_some_and(|n| self.seen >= n))
    }

    fn reset(&mut self) {
        self.seen = 0;
    }
}

/// Returns queued transcripts, repeating the last one
pub struct FakeTranscriber(Mutex<VecDeque<String>>);

impl FakeTranscriber {
    pub fn new(texts: &[&str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            texts.iter().map(ToString::to_string).collect(),
        )))
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
        let mut texts = self.0.lock().unwrap();
        if texts.len() > 1 {
            return Ok(texts.pop_front().unwrap_or_default());
        }
        texts
            .front()
            .cloned()
            .ok_or_else(|| Error::Stt("no transcript".to_string()))
    }
}

/// Chat model streaming scripted replies word by word; `None` fails the request
#[derive(Default)]
pub struct FakeChat {
    replies: Mutex<VecDeque<Option<String>>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeChat {
    pub fn new(replies: &[Option<&str>]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .iter()
                    .map(|r| r.map(ToString::to_string))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(messages.to_vec());
        match self.replies.lock().unwrap().pop_front().flatten() {
            Some(text) => {
                let tokens: Vec<Result<String>> = text
                    .split_inclusive(' ')
                    .map(|t| Ok(t.to_string()))
                    .collect();
                Ok(stream::iter(tokens).boxed())
            }
            None => Err(Error::Llm("503 service unavailable".to_string())),
        }
    }
}

/// Synthesizer that records every line and returns a little silence
#[derive(Clone, Default)]
pub struct RecordingSynth {
    pub lines: Arc<Mutex<Vec<String>>>,
    failing: bool,
}

impl RecordingSynth {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.lines().iter().filter(|l| *l == line).count()
    }
}

#[async_trait]
impl Synthesizer for RecordingSynth {
    fn name(&self) -> &'static str {
        if self.failing { "broken" } else { "recording" }
    }

    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        if self.failing {
            return Err(Error::Tts("quota exceeded".to_string()));
        }
        self.lines.lock().unwrap().push(text.to_string());
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(vec![0; 320]), Ok(vec![0; 320])];
        Ok(SpeechAudio {
            sample_rate: SAMPLE_RATE,
            chunks: stream::iter(chunks).boxed(),
        })
    }
}

/// Sink counting written bytes; draining takes `drain_time`
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub written: Arc<Mutex<usize>>,
    drain_time: Duration,
}

impl RecordingSink {
    pub fn slow(drain_time: Duration) -> Self {
        Self {
            drain_time,
            ..Self::default()
        }
    }

    pub fn written(&self) -> usize {
        *self.written.lock().unwrap()
    }
}

struct RecordingHandle {
    written: Arc<Mutex<usize>>,
    drain_time: Duration,
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn open(&self, _sample_rate: u32) -> Result<Box<dyn PlaybackHandle>> {
        Ok(Box::new(RecordingHandle {
            written: Arc::clone(&self.written),
            drain_time: self.drain_time,
        }))
    }
}

#[async_trait]
impl PlaybackHandle for RecordingHandle {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        *self.written.lock().unwrap() += pcm.len();
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        tokio::time::sleep(self.drain_time).await;
        Ok(())
    }

    async fn kill(&mut self) {}
}

/// A speaker over a recording synthesizer and sink
pub fn recording_speaker(
    config: &Config,
    shutdown: &CancellationToken,
) -> (Speaker, RecordingSynth) {
    let synth = RecordingSynth::default();
    let speaker = Speaker::new(
        vec![Arc::new(synth.clone())],
        Arc::new(RecordingSink::default()),
        WakeMatcher::from_config(&config.voice),
        shutdown.clone(),
    );
    (speaker, synth)
}

/// Remembers which cues were played and when they were cut short
#[derive(Default)]
pub struct CueLog {
    played: Mutex<Vec<Cue>>,
    stops: Mutex<Vec<usize>>,
}

impl CueLog {
    pub fn played(&self) -> Vec<Cue> {
        self.played.lock().unwrap().clone()
    }

    /// Number of cues played so far at each `stop`
    pub fn stops(&self) -> Vec<usize> {
        self.stops.lock().unwrap().clone()
    }
}

impl CuePlayer for CueLog {
    fn play(&self, cue: Cue) {
        self.played.lock().unwrap().push(cue);
    }

    fn stop(&self) {
        let played = self.played.lock().unwrap().len();
        self.stops.lock().unwrap().push(played);
    }
}

/// Actuator writing each command to a shared log, e.g. `tilt(-15)`
#[derive(Clone, Default)]
pub struct RecordingActuator(pub Arc<Mutex<Vec<String>>>);

impl RecordingActuator {
    pub fn log(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn drove_forward(&self) -> bool {
        self.log().iter().any(|c| c.starts_with("forward"))
    }

    fn record(&self, command: String) -> Result<()> {
        self.0.lock().unwrap().push(command);
        Ok(())
    }
}

impl Actuator for RecordingActuator {
    fn forward(&mut self, speed: u8) -> Result<()> {
        self.record(format!("forward({speed})"))
    }
    fn backward(&mut self, speed: u8) -> Result<()> {
        self.record(format!("backward({speed})"))
    }
    fn stop(&mut self) -> Result<()> {
        self.record("stop".to_string())
    }
    fn steer(&mut self, angle: i32) -> Result<()> {
        self.record(format!("steer({angle})"))
    }
    fn pan(&mut self, angle: i32) -> Result<()> {
        self.record(format!("pan({angle})"))
    }
    fn tilt(&mut self, angle: i32) -> Result<()> {
        self.record(format!("tilt({angle})"))
    }
}

/// Sensors standing at a table edge
pub struct TableEdge;

impl Sensors for TableEdge {
    fn distance_cm(&mut self) -> Result<f32> {
        Ok(80.0)
    }

    fn cliff_detected(&mut self) -> Result<bool> {
        Ok(true)
    }
}
