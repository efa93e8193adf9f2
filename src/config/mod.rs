//! Configuration management for the Jarvis robot
//!
//! Precedence is env > TOML file > built-in defaults.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub use file::{JarvisConfigFile, config_file_path, load_config_file};

/// Jarvis configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding memory, recordings and sound cues
    pub data_dir: PathBuf,

    pub voice: VoiceConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub safety: SafetyConfig,
    pub exploration: ExplorationConfig,
    pub control: ControlConfig,
    pub persona: PersonaConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Voice activity detection backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadBackend {
    /// WebRTC VAD with an aggressiveness mode
    #[default]
    WebRtc,
    /// Plain RMS energy threshold
    Energy,
}

impl FromStr for VadBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "webrtc" => Ok(Self::WebRtc),
            "energy" => Ok(Self::Energy),
            other => Err(Error::Config(format!("unknown vad backend: {other}"))),
        }
    }
}

/// Microphone, VAD, wake word and playback settings
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub wake_phrases: Vec<String>,
    pub wake_max_distance: usize,
    pub wake_similarity: f64,
    /// Keyword model (`.rpw`) scored frame by frame; transcript matching is
    /// used when it cannot be loaded
    pub wake_model: PathBuf,
    pub wake_threshold: f32,
    pub vad: VadBackend,
    pub vad_mode: u8,
    pub energy_threshold: f32,
    pub silence_threshold: Duration,
    pub max_record: Duration,
    pub min_record: Duration,
    /// Captures shorter than this are treated as a device glitch
    pub min_viable: Duration,
    pub fallback_record: Duration,
    /// ALSA device for the fixed-duration `arecord` fallback
    pub fallback_device: String,
    pub capture_retries: u32,
    pub retry_delay: Duration,
    pub follow_up: bool,
    pub follow_up_window: Duration,
    /// Consecutive speech frames that end the follow-up window
    pub follow_up_frames: usize,
    /// Transcriptions with fewer words are rejected as noise
    pub min_words: usize,
    pub playback_device: String,
    pub volume_boost: f32,
    pub cue_dir: PathBuf,
    pub recording_path: PathBuf,
}

/// Transcription service settings
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub base_url: String,
    pub model: String,
    pub language: String,
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Speech synthesis settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub speed: f64,
    pub instructions: Option<String>,
    pub use_openai: bool,
    pub piper_binary: String,
    pub piper_model: PathBuf,
    pub retries: u32,
}

/// Chat model settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub vision_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retries: u32,
    pub retry_delay: Duration,
    pub history_messages: usize,
}

/// Memory store settings
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub path: PathBuf,
    pub max_per_entity: usize,
    pub max_in_prompt: usize,
    pub recent_per_entity: usize,
}

/// Failure handling and table mode settings
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_consecutive_failures: u32,
    /// React to manual pad driving and to the car being picked up while exploring
    pub manual_control_detection: bool,
    pub table_exit_phrases: Vec<String>,
}

/// How the explorer drives between checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementStyle {
    /// Short bursts followed by a stop
    #[default]
    Creep,
    /// Keep driving until an obstacle shows up
    Continuous,
}

impl FromStr for MovementStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "creep" => Ok(Self::Creep),
            "continuous" => Ok(Self::Continuous),
            other => Err(Error::Config(format!("unknown movement style: {other}"))),
        }
    }
}

/// Autonomous wandering settings
#[derive(Debug, Clone)]
pub struct ExplorationConfig {
    pub enabled: bool,
    pub idle_timeout: Duration,
    pub max_duration: Duration,
    pub movement: MovementStyle,
    pub speed: u8,
    pub safe_distance_cm: f32,
    pub danger_distance_cm: f32,
    pub thought_min: Duration,
    pub thought_max: Duration,
    pub novelty_threshold: f32,
    pub camera_command: Vec<String>,
}

/// Manual/app control and action timing settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub deadband: i32,
    pub manual_timeout: Duration,
    pub app_timeout: Duration,
    pub action_time_scale: f64,
}

/// Personality settings
#[derive(Debug, Clone)]
pub struct PersonaConfig {
    pub name: String,
    pub companion: String,
    pub system_prompt_file: Option<PathBuf>,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS, chat and vision)
    pub openai: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            model: "whisper-1".to_string(),
            language: "sv".to_string(),
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            model: "tts-1".to_string(),
            voice: "onyx".to_string(),
            speed: 0.95,
            instructions: Some(
                "Speak Swedish naturally with energy and playfulness. \
                 You are a friendly robot car talking to a 9-year-old boy."
                    .to_string(),
            ),
            use_openai: true,
            piper_binary: "piper".to_string(),
            piper_model: PathBuf::from("sv_SE-nst-medium.onnx"),
            retries: 3,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            max_tokens: 300,
            temperature: 0.8,
            retries: 3,
            retry_delay: Duration::from_secs(1),
            history_messages: 20,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            manual_control_detection: true,
            table_exit_phrases: vec![
                "på golvet".to_string(),
                "du är nere".to_string(),
                "inte på bordet".to_string(),
            ],
        }
    }
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(60),
            max_duration: Duration::from_secs(3600),
            movement: MovementStyle::Creep,
            speed: 20,
            safe_distance_cm: 30.0,
            danger_distance_cm: 15.0,
            thought_min: Duration::from_secs(30),
            thought_max: Duration::from_secs(60),
            novelty_threshold: 0.3,
            camera_command: vec![
                "rpicam-still".to_string(),
                "-n".to_string(),
                "-t".to_string(),
                "1".to_string(),
                "--width".to_string(),
                "640".to_string(),
                "--height".to_string(),
                "480".to_string(),
                "-e".to_string(),
                "jpg".to_string(),
                "-o".to_string(),
                "-".to_string(),
            ],
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            deadband: 5,
            manual_timeout: Duration::from_secs(5),
            app_timeout: Duration::from_secs(60),
            action_time_scale: 1.0,
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "Jarvis".to_string(),
            companion: "Leon".to_string(),
            system_prompt_file: None,
        }
    }
}

/// Base URL of the `OpenAI` API
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

impl VoiceConfig {
    fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            wake_phrases: vec!["jarvis".to_string()],
            wake_max_distance: 1,
            wake_similarity: 0.9,
            wake_model: data_dir.join("jarvis.rpw"),
            wake_threshold: 0.5,
            vad: VadBackend::WebRtc,
            vad_mode: 3,
            energy_threshold: 0.03,
            silence_threshold: Duration::from_millis(1500),
            max_record: Duration::from_secs(8),
            min_record: Duration::from_millis(500),
            min_viable: Duration::from_millis(300),
            fallback_record: Duration::from_secs(4),
            fallback_device: "default".to_string(),
            capture_retries: 3,
            retry_delay: Duration::from_millis(500),
            follow_up: false,
            follow_up_window: Duration::from_secs(3),
            follow_up_frames: 6,
            min_words: 2,
            playback_device: "default".to_string(),
            volume_boost: 5.0,
            cue_dir: data_dir.join("sounds"),
            recording_path: data_dir.join("utterance.wav"),
        }
    }
}

impl MemoryConfig {
    fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("memory.json"),
            max_per_entity: 20,
            max_in_prompt: 15,
            recent_per_entity: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

/// Default data directory: `~/.local/share/jarvis`
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "jarvis")
        .map_or_else(|| PathBuf::from(".jarvis"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Built-in defaults rooted at `data_dir`
    #[must_use]
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            voice: VoiceConfig::with_data_dir(&data_dir),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::with_data_dir(&data_dir),
            safety: SafetyConfig::default(),
            exploration: ExplorationConfig::default(),
            control: ControlConfig::default(),
            persona: PersonaConfig::default(),
            api_keys: ApiKeys::default(),
            data_dir,
        }
    }

    /// Load configuration from the given file (or the standard path) and env
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        let mut config = Self::from_file(fc)?;

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.api_keys.openai = Some(key);
        }
        tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

        Ok(config)
    }

    /// Apply a parsed config file on top of the built-in defaults
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    #[allow(clippy::too_many_lines)]
    pub fn from_file(fc: JarvisConfigFile) -> Result<Self> {
        let data_dir = std::env::var("JARVIS_DATA_DIR")
            .ok()
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);
        let d = Self::with_data_dir(data_dir);

        let v = fc.voice;
        let vad_mode = v.vad_mode.unwrap_or(d.voice.vad_mode);
        if vad_mode > 3 {
            return Err(Error::Config(format!(
                "vad_mode must be 0..=3, got {vad_mode}"
            )));
        }
        let voice = VoiceConfig {
            wake_phrases: v
                .wake_phrases
                .filter(|p| !p.is_empty())
                .unwrap_or(d.voice.wake_phrases),
            wake_max_distance: v.wake_max_distance.unwrap_or(d.voice.wake_max_distance),
            wake_similarity: v.wake_similarity.unwrap_or(d.voice.wake_similarity),
            wake_model: v.wake_model.map_or(d.voice.wake_model, PathBuf::from),
            wake_threshold: v.wake_threshold.unwrap_or(d.voice.wake_threshold),
            vad: v.vad.as_deref().map_or(Ok(d.voice.vad), str::parse)?,
            vad_mode,
            energy_threshold: v.energy_threshold.unwrap_or(d.voice.energy_threshold),
            silence_threshold: secs(
                v.silence_threshold,
                d.voice.silence_threshold,
                "voice.silence_threshold",
            )?,
            max_record: secs(v.max_record, d.voice.max_record, "voice.max_record")?,
            min_record: secs(v.min_record, d.voice.min_record, "voice.min_record")?,
            min_viable: secs(v.min_viable, d.voice.min_viable, "voice.min_viable")?,
            fallback_record: secs(
                v.fallback_record,
                d.voice.fallback_record,
                "voice.fallback_record",
            )?,
            fallback_device: v.fallback_device.unwrap_or(d.voice.fallback_device),
            capture_retries: v.capture_retries.unwrap_or(d.voice.capture_retries).max(1),
            retry_delay: secs(v.retry_delay, d.voice.retry_delay, "voice.retry_delay")?,
            follow_up: v.follow_up.unwrap_or(d.voice.follow_up),
            follow_up_window: secs(
                v.follow_up_window,
                d.voice.follow_up_window,
                "voice.follow_up_window",
            )?,
            follow_up_frames: v.follow_up_frames.unwrap_or(d.voice.follow_up_frames),
            min_words: v.min_words.unwrap_or(d.voice.min_words),
            playback_device: v.playback_device.unwrap_or(d.voice.playback_device),
            volume_boost: v.volume_boost.unwrap_or(d.voice.volume_boost),
            cue_dir: v.cue_dir.map_or(d.voice.cue_dir, PathBuf::from),
            recording_path: v.recording_path.map_or(d.voice.recording_path, PathBuf::from),
        };
        if voice.min_record > voice.max_record {
            return Err(Error::Config(
                "voice.min_record must not exceed voice.max_record".to_string(),
            ));
        }

        let s = fc.stt;
        let stt = SttConfig {
            base_url: s.base_url.unwrap_or(d.stt.base_url),
            model: s.model.unwrap_or(d.stt.model),
            language: s.language.unwrap_or(d.stt.language),
            retries: s.retries.unwrap_or(d.stt.retries).max(1),
            retry_delay: secs(s.retry_delay, d.stt.retry_delay, "stt.retry_delay")?,
        };

        let t = fc.tts;
        let tts = TtsConfig {
            base_url: t.base_url.unwrap_or(d.tts.base_url),
            model: t.model.unwrap_or(d.tts.model),
            voice: t.voice.unwrap_or(d.tts.voice),
            speed: t.speed.unwrap_or(d.tts.speed).clamp(0.25, 4.0),
            instructions: t.instructions.or(d.tts.instructions),
            use_openai: t.use_openai.unwrap_or(d.tts.use_openai),
            piper_binary: t.piper_binary.unwrap_or(d.tts.piper_binary),
            piper_model: t.piper_model.map_or(d.tts.piper_model, PathBuf::from),
            retries: t.retries.unwrap_or(d.tts.retries).max(1),
        };

        let l = fc.llm;
        let llm = LlmConfig {
            base_url: l.base_url.unwrap_or(d.llm.base_url),
            model: l.model.unwrap_or(d.llm.model),
            vision_model: l.vision_model.unwrap_or(d.llm.vision_model),
            max_tokens: l.max_tokens.unwrap_or(d.llm.max_tokens),
            temperature: l.temperature.unwrap_or(d.llm.temperature),
            retries: l.retries.unwrap_or(d.llm.retries).max(1),
            retry_delay: secs(l.retry_delay, d.llm.retry_delay, "llm.retry_delay")?,
            history_messages: l.history_messages.unwrap_or(d.llm.history_messages),
        };

        let m = fc.memory;
        let memory = MemoryConfig {
            path: m.path.map_or(d.memory.path, PathBuf::from),
            max_per_entity: m.max_per_entity.unwrap_or(d.memory.max_per_entity).max(1),
            max_in_prompt: m.max_in_prompt.unwrap_or(d.memory.max_in_prompt),
            recent_per_entity: m.recent_per_entity.unwrap_or(d.memory.recent_per_entity),
        };

        let sf = fc.safety;
        let safety = SafetyConfig {
            max_consecutive_failures: sf
                .max_consecutive_failures
                .unwrap_or(d.safety.max_consecutive_failures)
                .max(1),
            manual_control_detection: sf
                .manual_control_detection
                .unwrap_or(d.safety.manual_control_detection),
            table_exit_phrases: sf
                .table_exit_phrases
                .unwrap_or(d.safety.table_exit_phrases),
        };

        let e = fc.exploration;
        let de = d.exploration;
        let exploration = ExplorationConfig {
            enabled: e.enabled.unwrap_or(de.enabled),
            idle_timeout: secs(e.idle_timeout, de.idle_timeout, "exploration.idle_timeout")?,
            max_duration: secs(e.max_duration, de.max_duration, "exploration.max_duration")?,
            movement: e.movement.as_deref().map_or(Ok(de.movement), str::parse)?,
            speed: e.speed.unwrap_or(de.speed).min(100),
            safe_distance_cm: e.safe_distance_cm.unwrap_or(de.safe_distance_cm),
            danger_distance_cm: e.danger_distance_cm.unwrap_or(de.danger_distance_cm),
            thought_min: secs(e.thought_min, de.thought_min, "exploration.thought_min")?,
            thought_max: secs(e.thought_max, de.thought_max, "exploration.thought_max")?,
            novelty_threshold: e.novelty_threshold.unwrap_or(de.novelty_threshold),
            camera_command: e
                .camera_command
                .filter(|c| !c.is_empty())
                .unwrap_or(de.camera_command),
        };
        if exploration.thought_min > exploration.thought_max {
            return Err(Error::Config(
                "exploration.thought_min must not exceed exploration.thought_max".to_string(),
            ));
        }

        let c = fc.control;
        let control = ControlConfig {
            deadband: c.deadband.unwrap_or(d.control.deadband),
            manual_timeout: secs(
                c.manual_timeout,
                d.control.manual_timeout,
                "control.manual_timeout",
            )?,
            app_timeout: secs(c.app_timeout, d.control.app_timeout, "control.app_timeout")?,
            action_time_scale: c
                .action_time_scale
                .unwrap_or(d.control.action_time_scale)
                .max(0.0),
        };

        let p = fc.persona;
        let persona = PersonaConfig {
            name: p.name.unwrap_or(d.persona.name),
            companion: p.companion.unwrap_or(d.persona.companion),
            system_prompt_file: p.system_prompt_file.map(PathBuf::from),
        };

        Ok(Self {
            data_dir: d.data_dir,
            voice,
            stt,
            tts,
            llm,
            memory,
            safety,
            exploration,
            control,
            persona,
            api_keys: ApiKeys {
                openai: fc.api_keys.openai,
            },
        })
    }

    /// The `OpenAI` key, or a config error naming what needed it
    ///
    /// # Errors
    ///
    /// Returns error if no key is configured
    pub fn require_openai_key(&self, purpose: &str) -> Result<&str> {
        self.api_keys
            .openai
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config(format!("OPENAI_API_KEY is required for {purpose}")))
    }
}

fn secs(value: Option<f64>, default: Duration, field: &str) -> Result<Duration> {
    value.map_or(Ok(default), |v| {
        Duration::try_from_secs_f64(v)
            .map_err(|e| Error::Config(format!("{field}: invalid duration {v}: {e}")))
    })
}
