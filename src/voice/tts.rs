//! Text-to-speech (TTS) processing
//!
//! Both backends produce raw 16-bit little-endian mono PCM as a stream of
//! chunks, so playback can start before synthesis finishes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Sample rate of `OpenAI` `pcm` output
pub const OPENAI_PCM_RATE: u32 = 24000;

/// Sample rate of the medium Piper voices
pub const PIPER_PCM_RATE: u32 = 22050;

/// Streamed PCM chunks
pub type PcmStream = BoxStream<'static, Result<Vec<u8>>>;

/// Synthesized speech, ready to be streamed to a sink
pub struct SpeechAudio {
    pub sample_rate: u32,
    pub chunks: PcmStream,
}

/// Synthesizes speech from text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis cannot be started
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio>;
}

/// `OpenAI` `/audio/speech` client
pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    voice: String,
    speed: f64,
    instructions: Option<String>,
}

impl OpenAiSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: &str, config: &TtsConfig) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_string()),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            instructions: config.instructions.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSpeech {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            instructions: Option<&'a str>,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "pcm",
            instructions: self.instructions.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
            .boxed();

        Ok(SpeechAudio {
            sample_rate: OPENAI_PCM_RATE,
            chunks,
        })
    }
}

/// Local Piper synthesizer
pub struct PiperSpeech {
    binary: PathBuf,
    model: PathBuf,
}

impl PiperSpeech {
    /// Locate the Piper binary
    ///
    /// # Errors
    ///
    /// Returns error if the binary is not on `PATH`
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let binary = which::which(&config.piper_binary)
            .map_err(|e| Error::Tts(format!("piper not found ({}): {e}", config.piper_binary)))?;

        Ok(Self {
            binary,
            model: config.piper_model.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for PiperSpeech {
    fn name(&self) -> &'static str {
        "piper"
    }

    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tts(format!("failed to start piper: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Tts("piper stdin unavailable".to_string()))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tts("piper stdout unavailable".to_string()))?;

        Ok(SpeechAudio {
            sample_rate: PIPER_PCM_RATE,
            chunks: read_chunks(child, stdout),
        })
    }
}

/// Stream a child's stdout in chunks, keeping the child alive until EOF
fn read_chunks(child: Child, stdout: ChildStdout) -> PcmStream {
    stream::unfold(Some((child, stdout)), |state| async move {
        let (mut child, mut stdout) = state?;
        let mut buf = vec![0u8; 4096];
        match stdout.read(&mut buf).await {
            Ok(0) => {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        tracing::warn!(%status, "piper exited with error");
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to reap piper"),
                    Ok(_) => {}
                }
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some((child, stdout))))
            }
            Err(e) => Some((Err(Error::from(e)), None)),
        }
    })
    .boxed()
}
