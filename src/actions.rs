//! Physical actions the model can ask for
//!
//! Each action is a fixed sequence of actuator steps. Body actions move the
//! car and are refused while driving is blocked; head actions only move the
//! camera servos and always run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hardware::{Actuator, stop_motion};
use crate::{Error, Result};

/// Pause between consecutive actions of one reply
pub const ACTION_GAP: Duration = Duration::from_millis(300);

/// Whether an action drives the car or only moves the head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Body,
    Head,
}

/// Every action the robot knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    MoveForward,
    MoveBackward,
    TurnLeft,
    TurnRight,
    Stop,
    RockBackForth,
    Dance,
    LookUp,
    LookDown,
    LookLeft,
    LookRight,
    LookAround,
    LookAtPerson,
    Nod,
    ShakeHead,
    TiltHead,
}

/// One actuator command or a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Forward(u8),
    Backward(u8),
    Stop,
    Steer(i32),
    Pan(i32),
    Tilt(i32),
    /// Wait, in milliseconds before time scaling
    Wait(u64),
}

impl Action {
    pub const ALL: [Self; 16] = [
        Self::MoveForward,
        Self::MoveBackward,
        Self::TurnLeft,
        Self::TurnRight,
        Self::Stop,
        Self::RockBackForth,
        Self::Dance,
        Self::LookUp,
        Self::LookDown,
        Self::LookLeft,
        Self::LookRight,
        Self::LookAround,
        Self::LookAtPerson,
        Self::Nod,
        Self::ShakeHead,
        Self::TiltHead,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MoveForward => "move_forward",
            Self::MoveBackward => "move_backward",
            Self::TurnLeft => "turn_left",
            Self::TurnRight => "turn_right",
            Self::Stop => "stop",
            Self::RockBackForth => "rock_back_forth",
            Self::Dance => "dance",
            Self::LookUp => "look_up",
            Self::LookDown => "look_down",
            Self::LookLeft => "look_left",
            Self::LookRight => "look_right",
            Self::LookAround => "look_around",
            Self::LookAtPerson => "look_at_person",
            Self::Nod => "nod",
            Self::ShakeHead => "shake_head",
            Self::TiltHead => "tilt_head",
        }
    }

    #[must_use]
    pub const fn category(self) -> Category {
        match self {
            Self::MoveForward
            | Self::MoveBackward
            | Self::TurnLeft
            | Self::TurnRight
            | Self::Stop
            | Self::RockBackForth
            | Self::Dance => Category::Body,
            _ => Category::Head,
        }
    }

    /// Actuator steps making up this action
    #[must_use]
    pub fn steps(self) -> Vec<Step> {
        use Step::{Backward, Forward, Pan, Steer, Stop, Tilt, Wait};

        match self {
            Self::MoveForward => vec![Steer(0), Forward(30), Wait(1500), Stop],
            Self::MoveBackward => vec![Steer(0), Backward(30), Wait(1500), Stop],
            Self::TurnLeft => vec![Steer(-30), Forward(30), Wait(1000), Stop, Steer(0)],
            Self::TurnRight => vec![Steer(30), Forward(30), Wait(1000), Stop, Steer(0)],
            Self::Stop => vec![Stop],
            Self::RockBackForth => {
                let mut steps = repeat(4, &[Forward(40), Wait(150), Backward(40), Wait(150)]);
                steps.push(Stop);
                steps
            }
            Self::Dance => {
                let mut steps = repeat(
                    3,
                    &[Steer(-20), Forward(30), Wait(300), Steer(20), Backward(30), Wait(300)],
                );
                steps.extend([Steer(0), Stop]);
                steps.extend(Self::LookAround.steps());
                steps
            }
            Self::LookUp => vec![Tilt(30)],
            Self::LookDown => vec![Tilt(-30)],
            Self::LookLeft => vec![Pan(-45)],
            Self::LookRight => vec![Pan(45)],
            Self::LookAround => vec![
                Pan(-60),
                Wait(500),
                Pan(0),
                Wait(500),
                Pan(60),
                Wait(500),
                Pan(0),
            ],
            Self::LookAtPerson => vec![Pan(0), Tilt(0)],
            Self::Nod => {
                let mut steps = repeat(3, &[Tilt(-15), Wait(150), Tilt(10), Wait(150)]);
                steps.push(Tilt(0));
                steps
            }
            Self::ShakeHead => {
                let mut steps = repeat(3, &[Pan(-25), Wait(150), Pan(25), Wait(150)]);
                steps.push(Pan(0));
                steps
            }
            Self::TiltHead => vec![Pan(20), Tilt(-10)],
        }
    }
}

fn repeat(times: usize, pattern: &[Step]) -> Vec<Step> {
    pattern.iter().copied().cycle().take(pattern.len() * times).collect()
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == name)
            .ok_or_else(|| Error::Hardware(format!("unknown action: {name}")))
    }
}

/// Runs actions against an actuator
#[derive(Debug, Clone)]
pub struct Dispatcher {
    time_scale: f64,
    shutdown: CancellationToken,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Dispatcher {
    /// `time_scale` multiplies every wait; 0 runs sequences instantly
    #[must_use]
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cut sequences short and stop the motors once `token` is cancelled
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run the action called `name`
    ///
    /// Returns false for unknown names, for body actions while
    /// `body_blocked`, and when the actuator fails.
    pub async fn execute(&self, name: &str, body_blocked: bool, actuator: &mut dyn Actuator) -> bool {
        let action = match name.parse::<Action>() {
            Ok(action) => action,
            Err(_) => {
                tracing::warn!(action = name, "unknown action");
                return false;
            }
        };

        if body_blocked && action.category() == Category::Body {
            tracing::info!(%action, "body action blocked");
            return false;
        }

        tracing::debug!(%action, "executing action");
        match self.run(action, actuator).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%action, error = %e, "action failed");
                if action.category() == Category::Body {
                    stop_motion(actuator);
                }
                false
            }
        }
    }

    /// Run every action in order with a short pause after each
    ///
    /// Returns how many actions ran.
    pub async fn execute_all(
        &self,
        names: &[String],
        body_blocked: bool,
        actuator: &mut dyn Actuator,
    ) -> usize {
        let mut executed = 0;
        for name in names {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.execute(name, body_blocked, actuator).await {
                executed += 1;
            }
            self.wait(ACTION_GAP).await;
        }
        executed
    }

    async fn run(&self, action: Action, actuator: &mut dyn Actuator) -> Result<()> {
        for step in action.steps() {
            match step {
                Step::Forward(speed) => actuator.forward(speed)?,
                Step::Backward(speed) => actuator.backward(speed)?,
                Step::Stop => actuator.stop()?,
                Step::Steer(angle) => actuator.steer(angle)?,
                Step::Pan(angle) => actuator.pan(angle)?,
                Step::Tilt(angle) => actuator.tilt(angle)?,
                Step::Wait(ms) => {
                    if !self.wait(Duration::from_millis(ms)).await {
                        tracing::info!(%action, "action cut short by shutdown");
                        return actuator.stop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns false when shutdown cut the wait short
    async fn wait(&self, duration: Duration) -> bool {
        if self.time_scale <= 0.0 {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(duration.mul_f64(self.time_scale)) => true,
        }
    }
}
