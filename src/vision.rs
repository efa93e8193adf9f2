//! Camera frames, scene descriptions and visual novelty
//!
//! Frames come from a still-capture command as JPEG. A vision model turns a
//! frame into a short Swedish description, and a color histogram tracker
//! decides whether the view changed enough to be worth talking about.

use std::collections::VecDeque;
use std::io::Cursor;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::LlmConfig;
use crate::{Error, Result};

/// JPEG quality of frames sent to the vision model
const UPLOAD_QUALITY: u8 = 60;

/// Frames wider than this are scaled down before upload
const UPLOAD_MAX_WIDTH: u32 = 640;

/// Size frames are reduced to for histogram comparison
const NOVELTY_SIZE: (u32, u32) = (160, 120);

/// Hue and saturation bins, as in `OpenCV`'s 0..180 / 0..256 ranges
const HUE_BINS: usize = 30;
const SAT_BINS: usize = 32;

/// Frames kept for novelty comparison
const NOVELTY_HISTORY: usize = 5;

const DESCRIBE_PROMPT: &str = "Beskriv kort vad du ser. Lista 3-5 objekt på svenska. Max 20 ord.";

/// One still image, JPEG encoded
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
}

impl Frame {
    /// Decode to RGB pixels
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid JPEG
    pub fn decode(&self) -> Result<RgbImage> {
        image::load_from_memory_with_format(&self.jpeg, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| Error::Vision(format!("failed to decode frame: {e}")))
    }

    /// Encode RGB pixels as a frame
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn encode(image: &RgbImage, quality: u8) -> Result<Self> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality)
            .encode_image(image)
            .map_err(|e| Error::Vision(format!("failed to encode frame: {e}")))?;
        Ok(Self { jpeg })
    }

    /// Smaller, lower quality copy for upload
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be decoded or re-encoded
    pub fn for_upload(&self) -> Result<Self> {
        let mut image = self.decode()?;
        if image.width() > UPLOAD_MAX_WIDTH {
            let height = image.height() * UPLOAD_MAX_WIDTH / image.width();
            image = image::imageops::resize(&image, UPLOAD_MAX_WIDTH, height, FilterType::Triangle);
        }
        Self::encode(&image, UPLOAD_QUALITY)
    }
}

/// Something that can take a picture
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Capture one frame
    ///
    /// # Errors
    ///
    /// Returns error if the camera is unavailable
    async fn capture(&self) -> Result<Frame>;
}

/// Takes stills by running a capture command that writes JPEG to stdout
///
/// The default is `rpicam-still ... -o -`.
pub struct CommandCamera {
    command: Vec<String>,
}

impl CommandCamera {
    /// # Errors
    ///
    /// Returns error if the command is empty
    pub fn new(command: &[String]) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Config("camera command is empty".to_string()));
        }
        Ok(Self {
            command: command.to_vec(),
        })
    }
}

#[async_trait]
impl FrameSource for CommandCamera {
    async fn capture(&self) -> Result<Frame> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Config("camera command is empty".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Vision(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(status = %output.status, stderr = %stderr.trim(), "camera capture failed");
            return Err(Error::Vision(format!("{program} exited with {}", output.status)));
        }
        if output.stdout.is_empty() {
            return Err(Error::Vision("camera returned no image".to_string()));
        }

        tracing::debug!(bytes = output.stdout.len(), "frame captured");
        Ok(Frame {
            jpeg: output.stdout,
        })
    }
}

/// Turns a frame into a short description
#[async_trait]
pub trait SceneDescriber: Send + Sync {
    /// # Errors
    ///
    /// Returns error if the vision service fails
    async fn describe(&self, frame: &Frame) -> Result<String>;
}

/// `OpenAI`-compatible vision model client
pub struct OpenAiVision {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[derive(Serialize)]
struct VisionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [VisionMessage<'a>; 1],
}

#[derive(Serialize)]
struct VisionMessage<'a> {
    role: &'a str,
    content: [ContentPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Deserialize)]
struct VisionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiVision {
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: &str, config: &LlmConfig) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for vision".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_string()),
            model: config.vision_model.clone(),
        })
    }
}

#[async_trait]
impl SceneDescriber for OpenAiVision {
    async fn describe(&self, frame: &Frame) -> Result<String> {
        let upload = frame.for_upload()?;
        let data = base64::engine::general_purpose::STANDARD.encode(&upload.jpeg);

        let request = VisionRequest {
            model: &self.model,
            max_tokens: 50,
            messages: [VisionMessage {
                role: "user",
                content: [
                    ContentPart::Text {
                        text: DESCRIBE_PROMPT,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/jpeg;base64,{data}"),
                            detail: "low",
                        },
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Vision(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "vision API error");
            return Err(Error::Vision(format!("API error {status}: {body}")));
        }

        let result: VisionResponse = response
            .json()
            .await
            .map_err(|e| Error::Vision(format!("failed to parse response: {e}")))?;

        let description = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Vision("empty description".to_string()))?;

        tracing::info!(description = %description, "scene described");
        Ok(description)
    }
}

/// Normalized hue/saturation histogram
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram(Vec<f32>);

impl Histogram {
    /// Histogram of a frame after shrinking it
    #[must_use]
    pub fn of(image: &RgbImage) -> Self {
        let small = image::imageops::resize(image, NOVELTY_SIZE.0, NOVELTY_SIZE.1, FilterType::Nearest);
        let mut bins = vec![0f32; HUE_BINS * SAT_BINS];
        for pixel in small.pixels() {
            let (h, s) = hue_saturation(pixel.0);
            let hb = (usize::from(h) * HUE_BINS / 180).min(HUE_BINS - 1);
            let sb = usize::from(s) * SAT_BINS / 256;
            bins[hb * SAT_BINS + sb] += 1.0;
        }

        let norm = bins.iter().map(|b| b * b).sum::<f32>().sqrt();
        if norm > 0.0 {
            for b in &mut bins {
                *b /= norm;
            }
        }
        Self(bins)
    }

    /// Pearson correlation, 1.0 for identical histograms
    #[must_use]
    pub fn correlation(&self, other: &Self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let n = self.0.len() as f32;
        let mean_a = self.0.iter().sum::<f32>() / n;
        let mean_b = other.0.iter().sum::<f32>() / n;

        let (mut cov, mut var_a, mut var_b) = (0f32, 0f32, 0f32);
        for (a, b) in self.0.iter().zip(&other.0) {
            let (da, db) = (a - mean_a, b - mean_b);
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = (var_a * var_b).sqrt();
        if denom <= f32::EPSILON {
            return if self == other { 1.0 } else { 0.0 };
        }
        cov / denom
    }
}

/// `OpenCV`-style hue (0..180) and saturation (0..=255)
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hue_saturation([r, g, b]: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let hue = if delta <= 0.0 {
        0.0
    } else if (max - r).abs() < f32::EPSILON {
        60.0 * ((g - b) / delta)
    } else if (max - g).abs() < f32::EPSILON {
        60.0 * ((b - r) / delta) + 120.0
    } else {
        60.0 * ((r - g) / delta) + 240.0
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };

    ((hue / 2.0).min(179.0) as u8, saturation.round().min(255.0) as u8)
}

/// Scores how different a frame is from the last few
#[derive(Debug, Default)]
pub struct NoveltyTracker {
    history: VecDeque<Histogram>,
}

impl NoveltyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Novelty in 0..=1; the first frame seen is always fully novel
    pub fn score(&mut self, image: &RgbImage) -> f32 {
        let current = Histogram::of(image);

        let novelty = if self.history.is_empty() {
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let average = self.history.iter().map(|h| current.correlation(h)).sum::<f32>()
                / self.history.len() as f32;
            1.0 - average.max(0.0)
        };

        self.history.push_back(current);
        if self.history.len() > NOVELTY_HISTORY {
            self.history.pop_front();
        }
        novelty
    }
}
