use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use picar_jarvis::config::Config;
use picar_jarvis::coordinator::{Coordinator, Exit, Hardware, Parts, Vision};
use picar_jarvis::dialogue::{ChatModel, OpenAiChat};
use picar_jarvis::hardware::LoggingActuator;
use picar_jarvis::memory::MemoryStore;
use picar_jarvis::persona::Persona;
use picar_jarvis::shutdown;
use picar_jarvis::vision::{CommandCamera, OpenAiVision};
use picar_jarvis::voice::capture::calculate_rms;
use picar_jarvis::voice::{
    AplayCues, AplaySink, ArecordRecorder, CpalMic, DetectorFactory, MicSource, OpenAiSpeech, PiperSpeech,
    SAMPLE_RATE, Speaker, SpeechToText, Synthesizer, Transcriber, UtteranceRecorder,
    WakeMatcher, WakeWordDetector, build_spotter,
};
use tokio_util::sync::CancellationToken;

/// Pause between TTS attempts
const TTS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Jarvis - voice and vision companion for a PiCar robot
#[derive(Parser)]
#[command(name = "jarvis", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the standard config location)
    #[arg(long, env = "JARVIS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// `OpenAI` API key for speech, chat and vision
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the robot loop (default)
    Run,
    /// Show microphone levels
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Speak a line through the configured voice
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hej! Det här är ett test av rösten.")]
        text: String,
    },
    /// Inspect or edit the memory document
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Print everything remembered
    Show,
    /// Remember something about an entity
    Add {
        /// Who or what the observation is about
        entity: String,
        /// The observation
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,picar_jarvis=info,jarvis=info",
        1 => "info,picar_jarvis=debug,jarvis=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(Exit::Shutdown) => ExitCode::SUCCESS,
        Ok(Exit::Fatal) => ExitCode::from(2),
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Exit> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(key) = cli.api_key {
        config.api_keys.openai = Some(key);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_robot(config).await,
        Command::TestMic { duration } => test_mic(duration).await.map(|()| Exit::Shutdown),
        Command::TestTts { text } => test_tts(&config, &text).await.map(|()| Exit::Shutdown),
        Command::Memory { action } => memory(&config, action).map(|()| Exit::Shutdown),
    }
}

async fn run_robot(config: Config) -> anyhow::Result<Exit> {
    let shutdown = shutdown::install(Arc::new(LoggingActuator));
    let persona = Persona::from_config(&config.persona)?;
    let api_key = config.require_openai_key("speech, chat and vision")?.to_string();

    let transcriber: Arc<dyn Transcriber> =
        Arc::new(SpeechToText::new_whisper(&api_key, &config.stt)?);
    let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(&api_key, &config.llm)?);

    let factory = detector_factory(&config, &transcriber);
    let wake = factory()?;
    let speaker =
        build_speaker(&config, Some(api_key.as_str()), shutdown.clone())?.with_interrupt(factory);

    let vision = if config.exploration.enabled {
        build_vision(&config, &api_key)
    } else {
        None
    };

    let parts = Parts {
        wake,
        recorder: build_recorder(&config),
        transcriber,
        chat,
        speaker,
        cues: Arc::new(AplayCues::new(
            config.voice.cue_dir.clone(),
            &config.voice.playback_device,
        )?),
        hardware: Hardware::default(),
        vision,
    };

    tracing::info!(
        name = %persona.name,
        wake_phrases = ?config.voice.wake_phrases,
        exploration = config.exploration.enabled,
        "starting jarvis"
    );
    let mut coordinator = Coordinator::new(config, persona, parts, shutdown);
    Ok(coordinator.run().await)
}

/// The cpal microphone, with `arecord` for degraded recordings when installed
fn build_recorder(config: &Config) -> UtteranceRecorder {
    let recorder = UtteranceRecorder::new(Box::new(CpalMic::new()), &config.voice);
    match ArecordRecorder::new(&config.voice.fallback_device) {
        Ok(arecord) => recorder.with_fallback(Box::new(arecord)),
        Err(e) => {
            tracing::warn!(error = %e, "degraded recordings will reuse the microphone");
            recorder
        }
    }
}

/// Each call opens a fresh microphone listening for the wake phrases
fn detector_factory(config: &Config, transcriber: &Arc<dyn Transcriber>) -> DetectorFactory {
    let transcriber = Arc::clone(transcriber);
    let voice = config.voice.clone();

    if voice.wake_model.exists() {
        tracing::info!(model = %voice.wake_model.display(), "wake word model");
    } else {
        tracing::warn!(
            model = %voice.wake_model.display(),
            "wake word model missing, falling back to transcript matching"
        );
    }

    Arc::new(move || {
        let mic: Box<dyn MicSource> = Box::new(CpalMic::new());
        let spotter = build_spotter(&voice, &transcriber, SAMPLE_RATE);
        Ok(WakeWordDetector::new(mic, spotter))
    })
}

/// `OpenAI` voice first when enabled, Piper as the fallback
fn build_speaker(
    config: &Config,
    api_key: Option<&str>,
    shutdown: CancellationToken,
) -> anyhow::Result<Speaker> {
    let mut backends: Vec<Arc<dyn Synthesizer>> = Vec::new();

    if config.tts.use_openai {
        if let Some(key) = api_key {
            backends.push(Arc::new(OpenAiSpeech::new(key, &config.tts)?));
        }
    }
    match PiperSpeech::new(&config.tts) {
        Ok(piper) => backends.push(Arc::new(piper)),
        Err(e) => tracing::warn!(error = %e, "piper fallback unavailable"),
    }
    anyhow::ensure!(!backends.is_empty(), "no speech synthesizer available");

    let sink = Arc::new(AplaySink::new(&config.voice.playback_device)?);
    Ok(Speaker::new(backends, sink, WakeMatcher::from_config(&config.voice), shutdown)
        .with_volume_boost(config.voice.volume_boost)
        .with_retries(config.tts.retries, TTS_RETRY_DELAY))
}

fn build_vision(config: &Config, api_key: &str) -> Option<Vision> {
    let camera = match CommandCamera::new(&config.exploration.camera_command) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::warn!(error = %e, "camera unavailable, exploring without vision");
            return None;
        }
    };
    match OpenAiVision::new(api_key, &config.llm) {
        Ok(describer) => Some(Vision {
            camera: Arc::new(camera),
            describer: Arc::new(describer),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "vision model unavailable");
            None
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut mic = CpalMic::new();
    mic.start()?;
    println!("Sample rate: {} Hz", mic.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = mic.read();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    mic.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is the USB mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Run: alsamixer (to check capture levels)");

    Ok(())
}

/// Speak one line through the same voice chain the robot uses
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let speaker = build_speaker(
        config,
        config.api_keys.openai.as_deref(),
        CancellationToken::new(),
    )?;
    let outcome = speaker.speak(text, false).await;
    println!("Playback finished: {outcome:?}");

    Ok(())
}

fn memory(config: &Config, action: MemoryCommand) -> anyhow::Result<()> {
    let store = MemoryStore::new(&config.memory);

    match action {
        MemoryCommand::Show => {
            let doc = store.load();
            println!("Memory file: {}", store.path().display());
            if doc.entities.is_empty() {
                println!("(empty)");
                return Ok(());
            }
            for (entity, observations) in &doc.entities {
                println!("\n{entity}:");
                for observation in &observations.observations {
                    println!(
                        "  [{}] {}",
                        observation.timestamp.format("%Y-%m-%d %H:%M"),
                        observation.content
                    );
                }
            }
            println!("\n{} observations", doc.observation_count());
        }
        MemoryCommand::Add { entity, text } => {
            let key = store
                .remember(&entity, &text)
                .with_context(|| format!("failed to remember {entity}"))?;
            println!("Remembered about {key}: {text}");
        }
    }

    Ok(())
}
