//! TOML configuration file loading
//!
//! Supports `~/.config/jarvis/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! Durations are given in (fractional) seconds.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct JarvisConfigFile {
    /// Directory for the memory document, recordings and sound cues
    pub data_dir: Option<String>,

    /// Microphone, VAD, wake word and playback settings
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Transcription service
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Chat model
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Memory store
    #[serde(default)]
    pub memory: MemoryFileConfig,

    /// Failure handling and table mode
    #[serde(default)]
    pub safety: SafetyFileConfig,

    /// Autonomous wandering
    #[serde(default)]
    pub exploration: ExplorationFileConfig,

    /// Manual/app control and action timing
    #[serde(default)]
    pub control: ControlFileConfig,

    /// Personality
    #[serde(default)]
    pub persona: PersonaFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Wake phrases (e.g. `["jarvis"]`)
    pub wake_phrases: Option<Vec<String>>,
    /// Max Levenshtein distance per wake token
    pub wake_max_distance: Option<usize>,
    /// Jaro-Winkler similarity accepted as a wake match
    pub wake_similarity: Option<f64>,
    /// Rustpotter keyword model file
    pub wake_model: Option<String>,
    pub wake_threshold: Option<f32>,
    /// "webrtc" or "energy"
    pub vad: Option<String>,
    /// WebRTC VAD aggressiveness 0..=3
    pub vad_mode: Option<u8>,
    /// RMS threshold for the energy VAD and wake segmentation
    pub energy_threshold: Option<f32>,
    pub silence_threshold: Option<f64>,
    pub max_record: Option<f64>,
    pub min_record: Option<f64>,
    pub min_viable: Option<f64>,
    /// Length of the degraded fixed-duration recording
    pub fallback_record: Option<f64>,
    pub fallback_device: Option<String>,
    pub capture_retries: Option<u32>,
    pub retry_delay: Option<f64>,
    pub follow_up: Option<bool>,
    pub follow_up_window: Option<f64>,
    pub follow_up_frames: Option<usize>,
    pub min_words: Option<usize>,
    /// ALSA playback device passed to `aplay -D`
    pub playback_device: Option<String>,
    pub volume_boost: Option<f32>,
    pub cue_dir: Option<String>,
    pub recording_path: Option<String>,
}

/// Transcription configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub retries: Option<u32>,
    pub retry_delay: Option<f64>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f64>,
    pub instructions: Option<String>,
    /// Disable the network backend and speak with Piper only
    pub use_openai: Option<bool>,
    pub piper_binary: Option<String>,
    pub piper_model: Option<String>,
    pub retries: Option<u32>,
}

/// Chat model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub vision_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub retries: Option<u32>,
    pub retry_delay: Option<f64>,
    /// Messages kept after the system turn
    pub history_messages: Option<usize>,
}

/// Memory store configuration
#[derive(Debug, Default, Deserialize)]
pub struct MemoryFileConfig {
    pub path: Option<String>,
    pub max_per_entity: Option<usize>,
    pub max_in_prompt: Option<usize>,
    pub recent_per_entity: Option<usize>,
}

/// Safety configuration
#[derive(Debug, Default, Deserialize)]
pub struct SafetyFileConfig {
    pub max_consecutive_failures: Option<u32>,
    pub manual_control_detection: Option<bool>,
    pub table_exit_phrases: Option<Vec<String>>,
}

/// Exploration configuration
#[derive(Debug, Default, Deserialize)]
pub struct ExplorationFileConfig {
    pub enabled: Option<bool>,
    /// Conversation inactivity before wandering starts
    pub idle_timeout: Option<f64>,
    pub max_duration: Option<f64>,
    /// "creep" or "continuous"
    pub movement: Option<String>,
    pub speed: Option<u8>,
    pub safe_distance_cm: Option<f32>,
    pub danger_distance_cm: Option<f32>,
    pub thought_min: Option<f64>,
    pub thought_max: Option<f64>,
    pub novelty_threshold: Option<f32>,
    /// Command that writes a still image to stdout
    pub camera_command: Option<Vec<String>>,
}

/// Manual and app control configuration
#[derive(Debug, Default, Deserialize)]
pub struct ControlFileConfig {
    pub deadband: Option<i32>,
    pub manual_timeout: Option<f64>,
    pub app_timeout: Option<f64>,
    /// Multiplier on the waits inside action sequences
    pub action_time_scale: Option<f64>,
}

/// Personality configuration
#[derive(Debug, Default, Deserialize)]
pub struct PersonaFileConfig {
    pub name: Option<String>,
    pub companion: Option<String>,
    /// Path to a file replacing the built-in system prompt
    pub system_prompt_file: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
}

/// Load the TOML config file from `path`, or from the standard location
///
/// Returns `JarvisConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> JarvisConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return JarvisConfigFile::default();
    };

    if !path.exists() {
        return JarvisConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            JarvisConfigFile::default()
        }),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            JarvisConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for the schema
pub fn parse_config(content: &str) -> crate::Result<JarvisConfigFile> {
    let config = toml::from_str(content)?;
    tracing::info!("loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/jarvis/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "jarvis")
        .map(|d| d.config_dir().join("config.toml"))
}
