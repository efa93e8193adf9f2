//! Robot session state owned by the coordinator

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// What the robot is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Listening,
    Conversation,
    Exploring,
    /// Standing on a table: head movements only
    TableMode,
    /// Someone is steering with the pad while the robot keeps talking
    ManualControl,
    /// The phone app has taken over
    AppControl,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Conversation => "conversation",
            Self::Exploring => "exploring",
            Self::TableMode => "table_mode",
            Self::ManualControl => "manual_control",
            Self::AppControl => "app_control",
        }
    }

    /// Whether the car may not drive on its own in this mode
    #[must_use]
    pub const fn blocks_body(self) -> bool {
        matches!(self, Self::TableMode | Self::ManualControl | Self::AppControl)
    }

    #[must_use]
    pub const fn is_remote_control(self) -> bool {
        matches!(self, Self::ManualControl | Self::AppControl)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive failures in the main loop
#[derive(Debug, Clone)]
pub struct FailureCounter {
    count: u32,
    threshold: u32,
    tripped: bool,
}

impl FailureCounter {
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: if threshold == 0 { 1 } else { threshold },
            tripped: false,
        }
    }

    /// Count a failure; returns true exactly once, when the threshold is reached
    pub fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        if self.count >= self.threshold && !self.tripped {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        if self.count > 0 {
            tracing::debug!(failures = self.count, "failure counter reset");
        }
        self.count = 0;
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Whether the threshold was ever reached
    #[must_use]
    pub const fn is_tripped(&self) -> bool {
        self.tripped
    }
}

/// Everything the main loop remembers between iterations
#[derive(Debug)]
pub struct RobotSession {
    mode: Mode,
    /// Mode to return to when remote control ends
    resume: Mode,
    pub failures: FailureCounter,
    last_activity: Instant,
    last_pad_input: Option<Instant>,
    /// Listen once more without the wake word
    pub follow_up: bool,
    /// The wake word was already heard; go straight to recording
    pub skip_wake: bool,
}

impl RobotSession {
    #[must_use]
    pub fn new(max_failures: u32) -> Self {
        Self {
            mode: Mode::Listening,
            resume: Mode::Listening,
            failures: FailureCounter::new(max_failures),
            last_activity: Instant::now(),
            last_pad_input: None,
            follow_up: false,
            skip_wake: false,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            tracing::info!(from = %self.mode, to = %mode, "mode change");
            self.mode = mode;
        }
    }

    #[must_use]
    pub const fn body_blocked(&self) -> bool {
        self.mode.blocks_body()
    }

    #[must_use]
    pub fn on_table(&self) -> bool {
        self.mode == Mode::TableMode
            || (self.mode.is_remote_control() && self.resume == Mode::TableMode)
    }

    /// Mark user interaction, postponing exploration
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// A conversation turn starts; table mode survives it
    pub fn begin_conversation(&mut self) {
        self.touch();
        if self.mode != Mode::TableMode {
            self.set_mode(Mode::Conversation);
        }
    }

    /// A conversation turn ended
    pub fn end_conversation(&mut self) {
        if self.mode == Mode::Conversation {
            self.set_mode(Mode::Listening);
        }
    }

    pub fn enter_table_mode(&mut self) {
        self.follow_up = false;
        self.set_mode(Mode::TableMode);
    }

    pub fn exit_table_mode(&mut self) {
        self.set_mode(Mode::Listening);
    }

    /// Hand the car to the remote; returns false if already in that mode
    pub fn enter_remote_control(&mut self, mode: Mode) -> bool {
        self.pad_input();
        if self.mode == mode {
            return false;
        }
        if !self.mode.is_remote_control() {
            self.resume = match self.mode {
                Mode::TableMode => Mode::TableMode,
                _ => Mode::Listening,
            };
        }
        self.follow_up = false;
        self.set_mode(mode);
        true
    }

    /// Remote control ended; back to the mode before it
    pub fn exit_remote_control(&mut self) {
        self.last_pad_input = None;
        self.touch();
        self.set_mode(self.resume);
    }

    pub fn pad_input(&mut self) {
        self.last_pad_input = Some(Instant::now());
    }

    /// Time since the last pad input, if any was seen
    #[must_use]
    pub fn pad_idle_for(&self) -> Option<Duration> {
        self.last_pad_input.map(|t| t.elapsed())
    }
}
