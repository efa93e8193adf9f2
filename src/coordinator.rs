//! Main robot loop
//!
//! One iteration of [`Coordinator::step`] handles remote control, waits for
//! the wake word (or a button press, or a follow-up), records and validates
//! an utterance and runs one dialogue turn. Failures that the user can fix
//! by speaking again are counted; too many in a row end the loop.
//!
//! All actuation happens here, on the coordinator's task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::actions::Dispatcher;
use crate::config::Config;
use crate::dialogue::{ChatModel, DialogueEngine, SpeechOutput, Turn};
use crate::exploration::{Eyes, ExplorationHooks, Explorer, Outcome};
use crate::hardware::{
    Actuator, Button, ControlPad, LoggingActuator, LoggingLed, NoButton, NoPad, NullSensors,
    PadOrigin, Sensors, StatusLed, apply_pad, reset_safe, stop_motion,
};
use crate::led::{LedIndicator, LedPattern};
use crate::memory::MemoryStore;
use crate::persona::{Persona, SystemEvent};
use crate::session::{Mode, RobotSession};
use crate::vision::{FrameSource, SceneDescriber};
use crate::voice::{
    CaptureError, CaptureLimits, Cue, CuePlayer, SpeakOutcome, Speaker, Transcriber,
    UtteranceRecorder, Validation, WakeWordDetector, is_valid_speech, transcribe_with_retry,
};

/// How long one wake word wait lasts before the pad is polled again
const WAKE_POLL: Duration = Duration::from_millis(500);

/// Wake word listening slice while exploring
const EXPLORE_WAKE_POLL: Duration = Duration::from_millis(100);

/// Pad polling interval during remote control
const REMOTE_POLL: Duration = Duration::from_millis(50);

/// Pause after the ding before recording starts
const PRE_RECORD: Duration = Duration::from_millis(300);

/// Lets the startup greeting's echo die out before listening
const ECHO_SETTLE: Duration = Duration::from_millis(1500);

/// Upper bound on the goodbye line after shutdown
const FAREWELL_LIMIT: Duration = Duration::from_secs(10);

/// Longest a held button is waited on
const BUTTON_RELEASE_LIMIT: Duration = Duration::from_secs(10);

/// Whether the loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(Exit),
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// SIGINT/SIGTERM
    Shutdown,
    /// Too many consecutive failures
    Fatal,
}

/// Motors, sensors and controls
pub struct Hardware {
    pub actuator: Box<dyn Actuator>,
    pub sensors: Box<dyn Sensors>,
    pub pad: Box<dyn ControlPad>,
    pub button: Box<dyn Button>,
    pub led: Box<dyn StatusLed>,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            actuator: Box::new(LoggingActuator),
            sensors: Box::new(NullSensors),
            pad: Box::new(NoPad),
            button: Box::new(NoButton),
            led: Box::new(LoggingLed),
        }
    }
}

/// Camera and vision model used while exploring
pub struct Vision {
    pub camera: Arc<dyn FrameSource>,
    pub describer: Arc<dyn SceneDescriber>,
}

/// Everything the coordinator drives
pub struct Parts {
    pub wake: WakeWordDetector,
    pub recorder: UtteranceRecorder,
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatModel>,
    pub speaker: Speaker,
    pub cues: Arc<dyn CuePlayer>,
    pub hardware: Hardware,
    pub vision: Option<Vision>,
}

/// The robot's main loop
pub struct Coordinator {
    config: Config,
    persona: Persona,
    session: RobotSession,
    wake: WakeWordDetector,
    recorder: UtteranceRecorder,
    transcriber: Arc<dyn Transcriber>,
    dialogue: DialogueEngine,
    speaker: Speaker,
    cues: Arc<dyn CuePlayer>,
    dispatcher: Dispatcher,
    actuator: Box<dyn Actuator>,
    sensors: Box<dyn Sensors>,
    pad: Box<dyn ControlPad>,
    button: Box<dyn Button>,
    led: LedIndicator,
    explorer: Explorer,
    vision: Option<Vision>,
    next_ride_comment: Option<Instant>,
    rng: StdRng,
    shutdown: CancellationToken,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        config: Config,
        persona: Persona,
        parts: Parts,
        shutdown: CancellationToken,
    ) -> Self {
        let dialogue = DialogueEngine::new(
            parts.chat,
            MemoryStore::new(&config.memory),
            &persona,
            &config.llm,
        );
        let explorer = Explorer::new(
            config.exploration.clone(),
            config.safety.manual_control_detection,
        );

        Self {
            session: RobotSession::new(config.safety.max_consecutive_failures),
            dispatcher: Dispatcher::new(config.control.action_time_scale)
                .with_shutdown(shutdown.clone()),
            wake: parts.wake,
            recorder: parts.recorder,
            transcriber: parts.transcriber,
            dialogue,
            speaker: parts.speaker,
            cues: parts.cues,
            actuator: parts.hardware.actuator,
            sensors: parts.hardware.sensors,
            pad: parts.hardware.pad,
            button: parts.hardware.button,
            led: LedIndicator::new(parts.hardware.led),
            explorer,
            vision: parts.vision,
            next_ride_comment: None,
            rng: StdRng::from_entropy(),
            config,
            persona,
            shutdown,
        }
    }

    #[must_use]
    pub const fn session(&self) -> &RobotSession {
        &self.session
    }

    #[must_use]
    pub const fn dialogue(&self) -> &DialogueEngine {
        &self.dialogue
    }

    /// Greet, loop until shutdown or a fatal failure, then park the car
    pub async fn run(&mut self) -> Exit {
        self.startup().await;

        let exit = loop {
            match self.step().await {
                Flow::Continue => {}
                Flow::Exit(exit) => break exit,
            }
        };

        if exit == Exit::Shutdown {
            let goodbye = self.persona.phrases.goodbye.clone();
            self.speaker.farewell(&goodbye, FAREWELL_LIMIT).await;
        }
        self.cleanup();
        tracing::info!(?exit, "robot loop ended");
        exit
    }

    /// Stop everything and return the car to its resting pose
    pub fn cleanup(&mut self) {
        self.wake.disarm();
        reset_safe(self.actuator.as_mut());
        self.led.show(LedPattern::Idle);
    }

    async fn startup(&mut self) {
        self.cues.play(Cue::Ready);
        self.pause(Duration::from_millis(500)).await;

        let greeting = self.persona.phrases.startup.clone();
        self.speaker.speak(&greeting, false).await;
        self.pause(ECHO_SETTLE).await;

        reset_safe(self.actuator.as_mut());
        self.session.touch();
        tracing::info!(name = %self.persona.name, "ready");
    }

    /// Run one iteration of the main loop
    pub async fn step(&mut self) -> Flow {
        if self.shutdown.is_cancelled() {
            return Flow::Exit(Exit::Shutdown);
        }

        if let Some(flow) = self.remote_control().await {
            return flow;
        }

        if self.session.skip_wake {
            self.session.skip_wake = false;
        } else {
            self.led.show(LedPattern::Idle);

            if self.exploration_due() {
                return self.explore().await;
            }
            if let Some(flow) = self.wait_for_turn().await {
                return flow;
            }
        }

        self.wake.disarm();
        self.listen_and_respond().await
    }

    /// Wake word, button or follow-up; `Some` means this iteration is over
    async fn wait_for_turn(&mut self) -> Option<Flow> {
        if self.session.follow_up {
            self.wake.disarm();
            let heard = self
                .recorder
                .listen_for_follow_up(
                    self.config.voice.follow_up_window,
                    self.config.voice.follow_up_frames,
                    &self.shutdown,
                )
                .await;
            if !heard {
                self.session.follow_up = false;
                return Some(Flow::Continue);
            }
            tracing::info!("follow-up speech");
            return None;
        }

        if self.button.is_pressed() {
            tracing::info!("button pressed");
            self.cues.play(Cue::Ding);
            let released_by = Instant::now() + BUTTON_RELEASE_LIMIT;
            while self.button.is_pressed()
                && Instant::now() < released_by
                && !self.shutdown.is_cancelled()
            {
                tokio::time::sleep(REMOTE_POLL).await;
            }
            self.pause(PRE_RECORD).await;
            return None;
        }

        if !self.wake.wait(Some(WAKE_POLL), &self.shutdown).await {
            return Some(Flow::Continue);
        }
        self.cues.play(Cue::Ding);
        self.pause(PRE_RECORD).await;
        None
    }

    /// Record, transcribe, validate and answer one utterance
    async fn listen_and_respond(&mut self) -> Flow {
        let in_follow_up = self.session.follow_up;

        self.led.show(LedPattern::Listening);
        let limits = CaptureLimits::from(&self.config.voice);
        let utterance = match self.recorder.capture(limits, &self.shutdown).await {
            Ok(utterance) => utterance,
            Err(CaptureError::Shutdown) => return Flow::Exit(Exit::Shutdown),
            Err(e) => {
                tracing::warn!(error = %e, "recording failed");
                self.session.follow_up = false;
                let line = self.persona.phrases.capture_failed.clone();
                return self.recoverable_failure(&line).await;
            }
        };

        self.led.show(LedPattern::Thinking);
        let text = transcribe_with_retry(
            self.transcriber.as_ref(),
            &utterance.wav,
            self.config.stt.retries,
            self.config.stt.retry_delay,
        )
        .await
        .unwrap_or_default();

        if let Validation::Invalid(reason) = is_valid_speech(&text, self.config.voice.min_words) {
            if in_follow_up {
                tracing::info!(reason = %reason, "nothing heard in follow-up");
                self.session.follow_up = false;
                return Flow::Continue;
            }
            tracing::info!(reason = %reason, transcript = %text, "utterance rejected");
            let line = self.persona.phrases.not_understood.clone();
            return self.recoverable_failure(&line).await;
        }
        tracing::info!(transcript = %text, "heard");

        if self.session.mode() == Mode::TableMode && self.is_table_exit(&text) {
            self.session.exit_table_mode();
            self.react(&SystemEvent::BackOnFloor).await;
        }

        self.converse(&text).await
    }

    async fn converse(&mut self, text: &str) -> Flow {
        self.session.begin_conversation();
        self.cues.play(Cue::Thinking);

        let turn = {
            let mut output = TurnOutput {
                speaker: &self.speaker,
                led: &mut self.led,
                cues: self.cues.as_ref(),
                spoke: false,
            };
            self.dialogue.converse(text, &mut output).await
        };
        self.cues.stop();

        match turn {
            Turn::Completed(parsed) => {
                self.session.failures.reset();
                self.run_actions(&parsed.actions).await;
                reset_safe(self.actuator.as_mut());

                self.led.show(LedPattern::Idle);
                self.cues.play(Cue::Listening);
                self.session.end_conversation();
                self.session.touch();
                self.session.follow_up = self.config.voice.follow_up;
                Flow::Continue
            }
            Turn::Interrupted => {
                self.session.end_conversation();
                self.session.skip_wake = true;
                Flow::Continue
            }
            Turn::Unavailable { apology } => {
                self.session.end_conversation();
                self.session.follow_up = false;
                self.led.show(LedPattern::Idle);
                self.recoverable_failure(&apology).await
            }
        }
    }

    /// Count a failure, tell the user, and give up at the threshold
    async fn recoverable_failure(&mut self, line: &str) -> Flow {
        let fatal = self.session.failures.record();
        tracing::warn!(
            failures = self.session.failures.count(),
            max = self.config.safety.max_consecutive_failures,
            "recoverable failure"
        );

        self.led.show(LedPattern::Idle);
        self.cues.play(Cue::Retry);
        self.speaker.speak(line, false).await;

        if fatal {
            tracing::error!("too many consecutive failures");
            let line = self.persona.phrases.fatal.clone();
            self.speaker.speak(&line, false).await;
            return Flow::Exit(Exit::Fatal);
        }
        Flow::Continue
    }

    fn is_table_exit(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config
            .safety
            .table_exit_phrases
            .iter()
            .any(|phrase| lower.contains(&phrase.to_lowercase()))
    }

    fn exploration_due(&self) -> bool {
        self.config.exploration.enabled
            && !self.session.follow_up
            && self.session.mode() != Mode::TableMode
            && self.session.idle_for() > self.config.exploration.idle_timeout
    }

    async fn explore(&mut self) -> Flow {
        self.session.set_mode(Mode::Exploring);

        let outcome = {
            let mut hooks = ExploreHooks {
                wake: &mut self.wake,
                pad: self.pad.as_mut(),
                deadband: self.config.control.deadband,
                dialogue: &self.dialogue,
                speaker: &self.speaker,
                persona: &self.persona,
                dispatcher: self.dispatcher.clone(),
                interrupted: false,
                shutdown: &self.shutdown,
            };
            let eyes = self.vision.as_ref().map(|v| Eyes {
                camera: v.camera.as_ref(),
                describer: v.describer.as_ref(),
            });
            self.explorer
                .explore(
                    self.actuator.as_mut(),
                    self.sensors.as_mut(),
                    eyes,
                    &mut hooks,
                    &self.shutdown,
                )
                .await
        };

        self.session.touch();
        match outcome {
            Outcome::Shutdown => return Flow::Exit(Exit::Shutdown),
            Outcome::WakeWord => {
                self.session.set_mode(Mode::Listening);
                self.cues.play(Cue::Ding);
                self.session.skip_wake = true;
            }
            Outcome::AppControl | Outcome::Timeout => {
                self.session.set_mode(Mode::Listening);
            }
            Outcome::TableMode => {
                self.session.enter_table_mode();
                if !self.react(&SystemEvent::TableDetected).await {
                    let line = self.persona.phrases.table_detected.clone();
                    self.speaker.speak(&line, true).await;
                }
            }
            Outcome::ManualControl => {
                self.session.set_mode(Mode::Listening);
                let line = self.persona.phrases.picked_up.clone();
                self.speaker.speak(&line, true).await;
            }
        }

        reset_safe(self.actuator.as_mut());
        Flow::Continue
    }

    /// Hand the car to the pad while someone is using it
    ///
    /// Returns `Some` while remote control is active, so the rest of the
    /// iteration is skipped.
    async fn remote_control(&mut self) -> Option<Flow> {
        let deadband = self.config.control.deadband;
        let input = self.pad.poll();

        if let Some(input) = input.filter(|i| i.is_active(deadband)) {
            let mode = match input.origin {
                PadOrigin::App => Some(Mode::AppControl),
                PadOrigin::Manual if self.config.safety.manual_control_detection => {
                    Some(Mode::ManualControl)
                }
                PadOrigin::Manual => None,
            };

            if let Some(mode) = mode {
                self.wake.disarm();
                let entered = self.session.enter_remote_control(mode);
                if let Err(e) = apply_pad(self.actuator.as_mut(), &input, deadband) {
                    tracing::warn!(error = %e, "failed to apply pad input");
                    stop_motion(self.actuator.as_mut());
                }
                if input.horn {
                    self.cues.play(Cue::Ding);
                }

                if entered {
                    self.announce_remote(mode).await;
                } else if mode == Mode::ManualControl {
                    self.comment_on_ride(input.drive.unwrap_or_default()).await;
                }

                self.pause(REMOTE_POLL).await;
                return Some(Flow::Continue);
            }
        }

        let mode = self.session.mode();
        if !mode.is_remote_control() {
            return None;
        }

        let timeout = if mode == Mode::AppControl {
            self.config.control.app_timeout
        } else {
            self.config.control.manual_timeout
        };
        if self.session.pad_idle_for().is_none_or(|idle| idle > timeout) {
            stop_motion(self.actuator.as_mut());
            self.session.exit_remote_control();
            self.next_ride_comment = None;
            if mode == Mode::AppControl {
                let line = self.persona.phrases.app_control_end.clone();
                self.speaker.speak(&line, false).await;
            } else {
                self.react(&SystemEvent::ManualControlEnded).await;
            }
            return Some(Flow::Continue);
        }

        if let Some(idle) = input {
            if let Err(e) = apply_pad(self.actuator.as_mut(), &idle, deadband) {
                tracing::warn!(error = %e, "failed to apply pad input");
            }
        }
        self.pause(REMOTE_POLL).await;
        Some(Flow::Continue)
    }

    async fn announce_remote(&mut self, mode: Mode) {
        if mode == Mode::AppControl {
            let line = self.persona.phrases.app_control_start.clone();
            self.speaker.speak(&line, false).await;
        } else {
            self.react(&SystemEvent::ManualControlStarted).await;
            let first = Duration::from_secs(self.rng.gen_range(5..=15));
            self.next_ride_comment = Some(Instant::now() + first);
        }
    }

    /// Now and then say something about being driven around
    async fn comment_on_ride(&mut self, (_, y): (i32, i32)) {
        if self.next_ride_comment.is_some_and(|at| Instant::now() < at) {
            return;
        }
        let event = SystemEvent::ManualDriving {
            fast: y.abs() > 50,
            forward: y > 0,
        };
        self.react(&event).await;
        let next = Duration::from_secs(self.rng.gen_range(10..=20));
        self.next_ride_comment = Some(Instant::now() + next);
    }

    /// Let the model react to a system event; returns false if it had nothing to say
    async fn react(&mut self, event: &SystemEvent) -> bool {
        let prompt = self.persona.event(event);
        tracing::info!(event = %prompt, "system event");
        let Some(parsed) = self.dialogue.react(&prompt).await else {
            return false;
        };

        self.run_actions(&parsed.actions).await;
        if parsed.speech.is_empty() {
            return false;
        }
        if self.speaker.speak(&parsed.speech, true).await == SpeakOutcome::Interrupted {
            self.session.skip_wake = true;
        }
        true
    }

    async fn run_actions(&mut self, actions: &[String]) {
        if actions.is_empty() {
            return;
        }
        let blocked = self.session.body_blocked();
        tracing::info!(?actions, body_blocked = blocked, "executing actions");
        self.dispatcher
            .execute_all(actions, blocked, self.actuator.as_mut())
            .await;
    }

    /// Cosmetic pause, scaled like action timing and cut short by shutdown
    async fn pause(&self, duration: Duration) {
        let scale = self.config.control.action_time_scale;
        if scale <= 0.0 {
            return;
        }
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(duration.mul_f64(scale)) => {}
        }
    }
}

/// Speaks a streamed reply
///
/// The first line silences the thinking cue and switches the LED to talking.
struct TurnOutput<'a> {
    speaker: &'a Speaker,
    led: &'a mut LedIndicator,
    cues: &'a dyn CuePlayer,
    spoke: bool,
}

#[async_trait]
impl SpeechOutput for TurnOutput<'_> {
    async fn say(&mut self, sentence: &str) -> SpeakOutcome {
        if !std::mem::replace(&mut self.spoke, true) {
            self.cues.stop();
            self.led.show(LedPattern::Talking);
        }
        self.speaker.speak(sentence, true).await
    }
}

/// What exploration may use from the rest of the robot
struct ExploreHooks<'a> {
    wake: &'a mut WakeWordDetector,
    pad: &'a mut dyn ControlPad,
    deadband: i32,
    dialogue: &'a DialogueEngine,
    speaker: &'a Speaker,
    persona: &'a Persona,
    dispatcher: Dispatcher,
    /// A thought was cut short by the wake word
    interrupted: bool,
    shutdown: &'a CancellationToken,
}

#[async_trait]
impl ExplorationHooks for ExploreHooks<'_> {
    async fn on_thought(
        &mut self,
        description: &str,
        actuator: &mut dyn Actuator,
    ) -> Option<String> {
        let prompt = self.persona.event(&SystemEvent::Exploring {
            description: description.to_string(),
        });
        let parsed = self.dialogue.react(&prompt).await?;

        self.dispatcher.execute_all(&parsed.actions, false, actuator).await;
        if parsed.speech.is_empty() {
            return None;
        }

        self.wake.disarm();
        if self.speaker.speak(&parsed.speech, true).await == SpeakOutcome::Interrupted {
            self.interrupted = true;
        }
        Some(parsed.speech)
    }

    async fn check_wake_word(&mut self) -> bool {
        if std::mem::take(&mut self.interrupted) {
            return true;
        }
        self.wake.wait(Some(EXPLORE_WAKE_POLL), self.shutdown).await
    }

    fn check_app_input(&mut self) -> bool {
        self.pad.poll().is_some_and(|input| input.is_active(self.deadband))
    }
}
