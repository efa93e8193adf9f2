//! Voice processing module
//!
//! Handles audio capture, voice activity detection, wake word detection,
//! transcription, speech synthesis and playback.

pub mod capture;
pub mod playback;
pub mod speaker;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod validator;
pub mod wake_word;

pub use capture::{
    ArecordRecorder, CpalMic, FixedRecorder, MicSource, SAMPLE_RATE, pcm_to_wav, samples_to_wav,
};
pub use playback::{AplayCues, AplaySink, Cue, CuePlayer, NoCues, PlaybackHandle, PlaybackSink};
pub use speaker::{PlaybackSignal, SpeakOutcome, Speaker};
pub use stt::{SpeechToText, Transcriber, transcribe_with_retry};
pub use tts::{OpenAiSpeech, PiperSpeech, SpeechAudio, Synthesizer};
pub use vad::{CaptureError, CaptureLimits, Utterance, UtteranceRecorder};
pub use validator::{Validation, is_valid_speech};
pub use wake_word::{
    DetectorFactory, KeywordModel, KeywordSpotter, ModelSpotter, RustpotterModel,
    TranscriptSpotter, WakeMatcher, WakeWordDetector, build_spotter,
};
