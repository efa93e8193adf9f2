//! Voice pipeline integration tests
//!
//! Runs wake word detection and speech output against scripted audio, without
//! any audio hardware.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use picar_jarvis::voice::{
    DetectorFactory, KeywordModel, ModelSpotter, SpeakOutcome, Speaker, TranscriptSpotter,
    WakeMatcher, WakeWordDetector,
};

mod common;
use common::{FakeTranscriber, RecordingSink, RecordingSynth, ScriptedMic, ScriptedSpotter};

fn matcher() -> WakeMatcher {
    WakeMatcher::new(&["jarvis".to_string()], 1, 0.9)
}

#[tokio::test]
async fn test_detector_stays_armed_across_polls() {
    let mic = ScriptedMic::endless(0.0);
    let mut detector = WakeWordDetector::new(Box::new(mic.clone()), Box::new(ScriptedSpotter::never()));
    let shutdown = CancellationToken::new();

    assert!(!detector.wait(Some(Duration::from_millis(30)), &shutdown).await);
    assert!(!detector.wait(Some(Duration::from_millis(30)), &shutdown).await);
    assert!(detector.is_armed());
    assert_eq!(mic.starts(), 1);

    detector.disarm();
    assert!(!detector.is_armed());
    assert_eq!(mic.stops(), 1);
}

#[tokio::test]
async fn test_wake_phrase_spoken_across_short_polls() {
    let mic = ScriptedMic::script(&[(0.0, 0.2), (0.3, 0.6), (0.0, 0.8)]);
    let spotter = TranscriptSpotter::new(FakeTranscriber::new(&["Jarvis!"]), matcher(), 0.03, 16000);
    let mut detector = WakeWordDetector::new(Box::new(mic.clone()), Box::new(spotter));
    let shutdown = CancellationToken::new();

    let mut detected = false;
    for _ in 0..40 {
        if detector.wait(Some(Duration::from_millis(20)), &shutdown).await {
            detected = true;
            break;
        }
    }

    assert!(detected);
    assert!(!detector.is_armed());
    assert_eq!(mic.starts(), 1);
}

#[tokio::test]
async fn test_other_speech_does_not_wake() {
    let mic = ScriptedMic::script(&[(0.3, 0.6), (0.0, 0.8)]);
    let spotter =
        TranscriptSpotter::new(FakeTranscriber::new(&["vad gör du"]), matcher(), 0.03, 16000);
    let mut detector = WakeWordDetector::new(Box::new(mic), Box::new(spotter));

    assert!(
        !detector
            .wait(Some(Duration::from_millis(300)), &CancellationToken::new())
            .await
    );
}

#[tokio::test]
async fn test_shutdown_ends_wait_and_disarms() {
    let mut detector = WakeWordDetector::new(
        Box::new(ScriptedMic::endless(0.0)),
        Box::new(ScriptedSpotter::never()),
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    assert!(!detector.wait(None, &shutdown).await);
    assert!(!detector.is_armed());
}

fn speaker(synth: &RecordingSynth, sink: RecordingSink, shutdown: &CancellationToken) -> Speaker {
    Speaker::new(
        vec![Arc::new(synth.clone())],
        Arc::new(sink),
        matcher(),
        shutdown.clone(),
    )
}

/// Each listener hears the wake word almost immediately
fn eager_listener() -> DetectorFactory {
    Arc::new(|| {
        Ok(WakeWordDetector::new(
            Box::new(ScriptedMic::endless(0.3)),
            Box::new(ScriptedSpotter::after(2)),
        ))
    })
}

#[tokio::test]
async fn test_line_plays_to_completion() {
    let synth = RecordingSynth::default();
    let sink = RecordingSink::default();
    let speaker = speaker(&synth, sink.clone(), &CancellationToken::new());

    let outcome = speaker.speak("Hej Leon!", true).await;

    assert_eq!(outcome, SpeakOutcome::Completed);
    assert_eq!(synth.lines(), ["Hej Leon!"]);
    assert_eq!(sink.written(), 640);
}

#[tokio::test]
async fn test_empty_line_is_not_synthesized() {
    let synth = RecordingSynth::default();
    let speaker = speaker(&synth, RecordingSink::default(), &CancellationToken::new());

    assert_eq!(speaker.speak("   ", true).await, SpeakOutcome::Completed);
    assert!(synth.lines().is_empty());
}

#[tokio::test]
async fn test_fallback_backend_used_when_primary_fails() {
    let fallback = RecordingSynth::default();
    let speaker = Speaker::new(
        vec![Arc::new(RecordingSynth::failing()), Arc::new(fallback.clone())],
        Arc::new(RecordingSink::default()),
        matcher(),
        CancellationToken::new(),
    )
    .with_retries(2, Duration::ZERO);

    assert_eq!(speaker.speak("Nu kör vi!", false).await, SpeakOutcome::Completed);
    assert_eq!(fallback.lines(), ["Nu kör vi!"]);
}

#[tokio::test]
async fn test_all_backends_failing_reports_failure() {
    let speaker = Speaker::new(
        vec![Arc::new(RecordingSynth::failing())],
        Arc::new(RecordingSink::default()),
        matcher(),
        CancellationToken::new(),
    )
    .with_retries(2, Duration::ZERO);

    assert_eq!(speaker.speak("Hallå?", false).await, SpeakOutcome::Failed);
}

#[tokio::test]
async fn test_wake_word_interrupts_long_line() {
    let synth = RecordingSynth::default();
    let speaker = speaker(
        &synth,
        RecordingSink::slow(Duration::from_secs(5)),
        &CancellationToken::new(),
    )
    .with_interrupt(eager_listener());

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        speaker.speak("Det var en gång en liten robotbil.", true),
    )
    .await
    .unwrap();

    assert_eq!(outcome, SpeakOutcome::Interrupted);
}

/// Keyword model hearing the wake word in any frame louder than 0.5
struct LoudFrameModel;

impl KeywordModel for LoudFrameModel {
    fn samples_per_frame(&self) -> usize {
        480
    }

    fn detect(&mut self, frame: &[f32]) -> bool {
        frame.iter().all(|s| *s > 0.5)
    }
}

#[tokio::test]
async fn test_keyword_model_interrupts_while_audio_never_goes_quiet() {
    let synth = RecordingSynth::default();
    let factory: DetectorFactory = Arc::new(|| {
        Ok(WakeWordDetector::new(
            Box::new(ScriptedMic::script(&[(0.3, 0.5), (0.8, 0.1), (0.3, 5.0)])),
            Box::new(ModelSpotter::new(LoudFrameModel)),
        ))
    });
    let speaker = speaker(
        &synth,
        RecordingSink::slow(Duration::from_secs(5)),
        &CancellationToken::new(),
    )
    .with_interrupt(factory);

    let started = tokio::time::Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        speaker.speak("Det var en gång en liten robotbil.", true),
    )
    .await
    .unwrap();

    assert_eq!(outcome, SpeakOutcome::Interrupted);
    assert!(started.elapsed() < Duration::from_millis(800));
}

#[tokio::test]
async fn test_wake_word_after_natural_end_is_completed() {
    let synth = RecordingSynth::default();
    let mic = ScriptedMic::script(&[(0.0, 0.3), (0.8, 0.1)]);
    let factory: DetectorFactory = {
        let mic = mic.clone();
        Arc::new(move || {
            Ok(WakeWordDetector::new(
                Box::new(mic.clone()),
                Box::new(ModelSpotter::new(LoudFrameModel)),
            ))
        })
    };
    let speaker = speaker(
        &synth,
        RecordingSink::slow(Duration::from_millis(50)),
        &CancellationToken::new(),
    )
    .with_interrupt(factory);

    let outcome = speaker.speak("Hej Leon!", true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(outcome, SpeakOutcome::Completed);
    // The listener closed its mic with the line
    assert_eq!(mic.starts(), 1);
    assert_eq!(mic.stops(), 1);
}

#[tokio::test]
async fn test_line_naming_the_wake_word_is_not_interruptible() {
    let synth = RecordingSynth::default();
    let speaker = speaker(
        &synth,
        RecordingSink::slow(Duration::from_millis(300)),
        &CancellationToken::new(),
    )
    .with_interrupt(eager_listener());

    let outcome = speaker.speak("Säg Jarvis så lyssnar jag!", true).await;

    assert_eq!(outcome, SpeakOutcome::Completed);
}

#[tokio::test]
async fn test_farewell_plays_after_shutdown() {
    let synth = RecordingSynth::default();
    let shutdown = CancellationToken::new();
    let speaker = speaker(&synth, RecordingSink::default(), &shutdown);
    shutdown.cancel();

    assert_eq!(speaker.speak("Hej!", false).await, SpeakOutcome::Failed);
    assert_eq!(
        speaker.farewell("Hej då!", Duration::from_secs(1)).await,
        SpeakOutcome::Completed
    );
    assert_eq!(synth.lines(), ["Hej då!"]);
}

#[tokio::test]
async fn test_farewell_bounded_by_limit() {
    let synth = RecordingSynth::default();
    let speaker = speaker(
        &synth,
        RecordingSink::slow(Duration::from_secs(5)),
        &CancellationToken::new(),
    );

    let outcome = speaker.farewell("Hej då!", Duration::from_millis(100)).await;

    assert_eq!(outcome, SpeakOutcome::Failed);
}
