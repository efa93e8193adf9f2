//! Speech output with wake-word interruption
//!
//! While a line plays, an interrupt listener runs on its own task with a
//! fresh detector. The listener and the speaker race on a single atomic:
//! whoever leaves `PLAYING` first decides the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::playback::{GainStage, PlaybackSink};
use super::tts::Synthesizer;
use super::wake_word::{DetectorFactory, WakeMatcher};
use crate::Error;
use crate::dialogue::SpeechOutput;

const PLAYING: u8 = 0;
const INTERRUPTED: u8 = 1;
const COMPLETED: u8 = 2;

/// Result of speaking one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Completed,
    Failed,
    Interrupted,
}

/// Shared state of one playback
#[derive(Debug)]
pub struct PlaybackSignal {
    state: AtomicU8,
    cancel: CancellationToken,
}

impl PlaybackSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PLAYING),
            cancel: CancellationToken::new(),
        })
    }

    /// Mark the playback interrupted, then stop it
    ///
    /// Returns false if playback already finished.
    pub fn interrupt(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PLAYING, INTERRUPTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.cancel.cancel();
        }
        won
    }

    /// Mark the playback finished naturally
    ///
    /// Returns false if an interruption got there first.
    pub fn complete(&self) -> bool {
        self.state
            .compare_exchange(PLAYING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::Acquire) == INTERRUPTED
    }

    /// Resolves once the playback was interrupted
    pub async fn interrupted(&self) {
        self.cancel.cancelled().await;
    }
}

/// Outcome of one attempt on one backend
enum Attempt {
    Done(SpeakOutcome),
    /// Nothing was played yet, so the line can be retried
    Retry(Error),
}

/// Speaks text through a primary and a fallback synthesizer
pub struct Speaker {
    backends: Vec<Arc<dyn Synthesizer>>,
    sink: Arc<dyn PlaybackSink>,
    interrupt: Option<DetectorFactory>,
    matcher: WakeMatcher,
    volume_boost: f32,
    retries: u32,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl Speaker {
    /// `backends` are tried in order; the first is the primary
    #[must_use]
    pub fn new(
        backends: Vec<Arc<dyn Synthesizer>>,
        sink: Arc<dyn PlaybackSink>,
        matcher: WakeMatcher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backends,
            sink,
            interrupt: None,
            matcher,
            volume_boost: 1.0,
            retries: 1,
            retry_delay: Duration::ZERO,
            shutdown,
        }
    }

    /// Allow interruption by the wake word, listening with detectors from `factory`
    #[must_use]
    pub fn with_interrupt(mut self, factory: DetectorFactory) -> Self {
        self.interrupt = Some(factory);
        self
    }

    #[must_use]
    pub const fn with_volume_boost(mut self, boost: f32) -> Self {
        self.volume_boost = boost;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = if retries == 0 { 1 } else { retries };
        self.retry_delay = delay;
        self
    }

    /// Speak one line
    ///
    /// Lines containing the wake word are never interruptible, since the
    /// speaker would hear itself.
    pub async fn speak(&self, text: &str, allow_interrupt: bool) -> SpeakOutcome {
        self.speak_until(text, allow_interrupt, &self.shutdown).await
    }

    /// Speak a last line after shutdown was requested
    ///
    /// Not interruptible and bounded by `limit`.
    pub async fn farewell(&self, text: &str, limit: Duration) -> SpeakOutcome {
        let guard = CancellationToken::new();
        let outcome = tokio::time::timeout(limit, self.speak_until(text, false, &guard)).await;
        outcome.unwrap_or_else(|_| {
            tracing::warn!("farewell timed out");
            SpeakOutcome::Failed
        })
    }

    async fn speak_until(
        &self,
        text: &str,
        allow_interrupt: bool,
        shutdown: &CancellationToken,
    ) -> SpeakOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SpeakOutcome::Completed;
        }

        let interruptible = allow_interrupt && !self.matcher.matches(text);
        tracing::debug!(text, interruptible, "speaking");

        for backend in &self.backends {
            for attempt in 1..=self.retries {
                if attempt > 1 {
                    tokio::time::sleep(self.retry_delay).await;
                }
                if shutdown.is_cancelled() {
                    return SpeakOutcome::Failed;
                }
                match self.play(backend.as_ref(), text, interruptible, shutdown).await {
                    Attempt::Done(outcome) => return outcome,
                    Attempt::Retry(e) => tracing::warn!(
                        backend = backend.name(),
                        attempt,
                        error = %e,
                        "speech attempt failed"
                    ),
                }
            }
        }

        tracing::error!(text, "all speech backends failed");
        SpeakOutcome::Failed
    }

    async fn play(
        &self,
        backend: &dyn Synthesizer,
        text: &str,
        interruptible: bool,
        shutdown: &CancellationToken,
    ) -> Attempt {
        let mut audio = match backend.synthesize(text).await {
            Ok(audio) => audio,
            Err(e) => return Attempt::Retry(e),
        };
        let mut handle = match self.sink.open(audio.sample_rate).await {
            Ok(handle) => handle,
            Err(e) => return Attempt::Retry(e),
        };

        let signal = PlaybackSignal::new();
        let listener = if interruptible {
            self.spawn_listener(&signal)
        } else {
            None
        };

        let mut gain = GainStage::new(self.volume_boost);
        let mut started = false;

        let result = loop {
            tokio::select! {
                biased;

                () = signal.interrupted() => {
                    handle.kill().await;
                    tracing::info!("speech interrupted by wake word");
                    break Attempt::Done(SpeakOutcome::Interrupted);
                }
                () = shutdown.cancelled() => {
                    handle.kill().await;
                    break Attempt::Done(SpeakOutcome::Failed);
                }
                chunk = audio.chunks.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = handle.write(&gain.process(&bytes)).await {
                            handle.kill().await;
                            break if started {
                                tracing::warn!(error = %e, "playback failed mid-line");
                                Attempt::Done(SpeakOutcome::Failed)
                            } else {
                                Attempt::Retry(e)
                            };
                        }
                        started = true;
                    }
                    Some(Err(e)) => {
                        handle.kill().await;
                        break if started {
                            tracing::warn!(error = %e, "speech stream failed mid-line");
                            Attempt::Done(SpeakOutcome::Failed)
                        } else {
                            Attempt::Retry(e)
                        };
                    }
                    None => break self.finish(handle.as_mut(), &signal).await,
                }
            }
        };

        if let Some(task) = listener {
            task.abort();
            let _ = task.await;
        }
        result
    }

    /// Let queued audio play out, still honoring interruption
    async fn finish(
        &self,
        handle: &mut dyn super::playback::PlaybackHandle,
        signal: &PlaybackSignal,
    ) -> Attempt {
        let drained = tokio::select! {
            biased;
            () = signal.interrupted() => None,
            result = handle.drain() => Some(result),
        };

        match drained {
            None => {
                handle.kill().await;
                tracing::info!("speech interrupted by wake word");
                Attempt::Done(SpeakOutcome::Interrupted)
            }
            Some(result) => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "playback ended with error");
                }
                if signal.complete() {
                    Attempt::Done(SpeakOutcome::Completed)
                } else {
                    Attempt::Done(SpeakOutcome::Interrupted)
                }
            }
        }
    }

    fn spawn_listener(&self, signal: &Arc<PlaybackSignal>) -> Option<JoinHandle<()>> {
        let factory = self.interrupt.as_ref()?;
        let mut detector = match factory() {
            Ok(detector) => detector,
            Err(e) => {
                tracing::warn!(error = %e, "interrupt listener unavailable");
                return None;
            }
        };

        let signal = Arc::clone(signal);
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            if detector.wait(None, &shutdown).await && signal.interrupt() {
                tracing::debug!("interrupt listener fired");
            }
        }))
    }
}

#[async_trait]
impl SpeechOutput for Speaker {
    async fn say(&mut self, sentence: &str) -> SpeakOutcome {
        self.speak(sentence, true).await
    }
}
