//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::SttConfig;
use crate::{Error, Result};

/// Response from `OpenAI` Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Turns a WAV recording into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one WAV artifact
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Transcribes speech to text through an `OpenAI`-compatible Whisper endpoint
pub struct SpeechToText {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    language: String,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: &str, config: &SttConfig) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_string()),
            model: config.model.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        let text = result.text.trim().to_string();
        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}

/// Transcribe with bounded retries, reusing the same artifact each attempt
///
/// Never fails: exhausting the attempts yields `None`.
pub async fn transcribe_with_retry(
    transcriber: &dyn Transcriber,
    wav: &[u8],
    attempts: u32,
    delay: Duration,
) -> Option<String> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(delay).await;
        }
        match transcriber.transcribe(wav).await {
            Ok(text) => return Some(text),
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "transcription attempt failed");
            }
        }
    }
    tracing::error!(attempts, "transcription failed");
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transcriber for Flaky {
        async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(Error::Stt("503".to_string()))
            } else {
                Ok("kör framåt".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let stt = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let text = transcribe_with_retry(&stt, b"wav", 3, Duration::ZERO).await;
        assert_eq!(text.as_deref(), Some("kör framåt"));
        assert_eq!(stt.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let stt = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        assert!(transcribe_with_retry(&stt, b"wav", 3, Duration::ZERO).await.is_none());
        assert_eq!(stt.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_requires_key() {
        assert!(SpeechToText::new_whisper("", &SttConfig::default()).is_err());
    }
}
