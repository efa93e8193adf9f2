//! Curious wandering while nobody is talking
//!
//! The explorer drives slowly, steers away from obstacles and now and then
//! stops to look around. When the view changed enough it asks the vision
//! model what it sees and hands the description to the caller, who may say
//! something about it. The cliff sensor is checked before anything else on
//! every iteration, and the motors are stopped however the loop ends.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::{ExplorationConfig, MovementStyle};
use crate::hardware::{Actuator, Sensors, read_cliff, read_distance, stop_motion};
use crate::vision::{FrameSource, NoveltyTracker, SceneDescriber};

/// Delay between iterations
const TICK: Duration = Duration::from_millis(100);

/// Burst length in creep mode
const CREEP_BURST: Duration = Duration::from_millis(300);

/// Closer than this, someone is probably holding the car
const PICKED_UP_CM: f32 = 5.0;

/// A jump this large between readings means the car was moved by hand
const PICKED_UP_JUMP_CM: f32 = 50.0;

/// Why exploration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    WakeWord,
    /// An edge was found; the car backed off it
    TableMode,
    AppControl,
    /// The car was picked up
    ManualControl,
    Timeout,
    Shutdown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WakeWord => "wake_word",
            Self::TableMode => "table_mode",
            Self::AppControl => "app_control",
            Self::ManualControl => "manual_control",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Callbacks into the rest of the robot
#[async_trait]
pub trait ExplorationHooks: Send {
    /// React to something seen; returns what was said, if anything
    ///
    /// The car is stopped while this runs and `actuator` may be used for
    /// gestures.
    async fn on_thought(&mut self, description: &str, actuator: &mut dyn Actuator)
    -> Option<String>;

    /// Briefly listen for the wake word
    async fn check_wake_word(&mut self) -> bool;

    /// Whether someone started using the remote control
    fn check_app_input(&mut self) -> bool;
}

/// Vision access for thoughts
pub struct Eyes<'a> {
    pub camera: &'a dyn FrameSource,
    pub describer: &'a dyn SceneDescriber,
}

/// Wander loop state
pub struct Explorer {
    config: ExplorationConfig,
    detect_pickup: bool,
    novelty: NoveltyTracker,
    rng: StdRng,
}

impl Explorer {
    #[must_use]
    pub fn new(config: ExplorationConfig, detect_pickup: bool) -> Self {
        Self {
            config,
            detect_pickup,
            novelty: NoveltyTracker::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Fixed random seed, for reproducible turns in tests
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Explore until something needs attention
    pub async fn explore(
        &mut self,
        actuator: &mut dyn Actuator,
        sensors: &mut dyn Sensors,
        eyes: Option<Eyes<'_>>,
        hooks: &mut dyn ExplorationHooks,
        shutdown: &CancellationToken,
    ) -> Outcome {
        tracing::info!(max_duration = ?self.config.max_duration, "exploration started");
        let outcome = self.wander(actuator, sensors, eyes, hooks, shutdown).await;
        stop_motion(actuator);
        tracing::info!(%outcome, "exploration ended");
        outcome
    }

    async fn wander(
        &mut self,
        actuator: &mut dyn Actuator,
        sensors: &mut dyn Sensors,
        eyes: Option<Eyes<'_>>,
        hooks: &mut dyn ExplorationHooks,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let started = Instant::now();
        let mut next_thought = started + self.thought_interval();
        let mut previous_distance: Option<f32> = None;

        loop {
            if shutdown.is_cancelled() {
                return Outcome::Shutdown;
            }

            if read_cliff(sensors) {
                tracing::warn!("cliff detected");
                stop_motion(actuator);
                if let Err(e) = self.back_off_edge(actuator, shutdown).await {
                    tracing::warn!(error = %e, "failed to back off edge");
                }
                return Outcome::TableMode;
            }

            if started.elapsed() >= self.config.max_duration {
                return Outcome::Timeout;
            }

            if hooks.check_wake_word().await {
                stop_motion(actuator);
                return Outcome::WakeWord;
            }

            if hooks.check_app_input() {
                stop_motion(actuator);
                return Outcome::AppControl;
            }

            let distance = read_distance(sensors);
            tracing::trace!(distance, "distance");
            if self.detect_pickup
                && previous_distance.is_some_and(|previous| {
                    distance < PICKED_UP_CM || (distance - previous).abs() > PICKED_UP_JUMP_CM
                })
            {
                tracing::info!(distance, "car seems to have been picked up");
                stop_motion(actuator);
                return Outcome::ManualControl;
            }
            previous_distance = Some(distance);

            let moved = if distance < self.config.danger_distance_cm {
                tracing::debug!(distance, "too close, backing up");
                self.backup_and_turn(actuator, shutdown).await
            } else if distance < self.config.safe_distance_cm {
                tracing::debug!(distance, "getting close, turning");
                self.turn_slightly(actuator, shutdown).await
            } else {
                self.advance(actuator, shutdown).await
            };
            if let Err(e) = moved {
                tracing::warn!(error = %e, "exploration move failed");
                stop_motion(actuator);
            }

            if distance >= self.config.safe_distance_cm && Instant::now() >= next_thought {
                self.think(actuator, eyes.as_ref(), hooks, shutdown).await;
                next_thought = Instant::now() + self.thought_interval();
            }

            pause(TICK, shutdown).await;
        }
    }

    /// Stop, look around, and maybe share a thought about the view
    async fn think(
        &mut self,
        actuator: &mut dyn Actuator,
        eyes: Option<&Eyes<'_>>,
        hooks: &mut dyn ExplorationHooks,
        shutdown: &CancellationToken,
    ) {
        stop_motion(actuator);
        if let Err(e) = self.look_around(actuator, shutdown).await {
            tracing::warn!(error = %e, "look around failed");
        }

        let Some(eyes) = eyes else {
            return;
        };
        let frame = match eyes.camera.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "no frame for thought");
                return;
            }
        };
        let novelty = match frame.decode() {
            Ok(image) => self.novelty.score(&image),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable frame");
                return;
            }
        };
        tracing::debug!(novelty, "view novelty");
        if novelty <= self.config.novelty_threshold {
            return;
        }

        match eyes.describer.describe(&frame).await {
            Ok(description) => {
                if let Some(said) = hooks.on_thought(&description, actuator).await {
                    tracing::info!(said = %said, "exploration thought");
                }
            }
            Err(e) => tracing::warn!(error = %e, "scene description failed"),
        }
    }

    fn thought_interval(&mut self) -> Duration {
        let (min, max) = (self.config.thought_min, self.config.thought_max);
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    fn random_angle(&mut self, min: i32, max: i32) -> i32 {
        let angle = self.rng.gen_range(min..=max);
        if self.rng.gen_bool(0.5) { angle } else { -angle }
    }

    async fn advance(&mut self, actuator: &mut dyn Actuator, shutdown: &CancellationToken) -> Result<()> {
        actuator.steer(0)?;
        actuator.forward(self.config.speed)?;
        if self.config.movement == MovementStyle::Creep {
            pause(CREEP_BURST, shutdown).await;
            actuator.stop()?;
        }
        Ok(())
    }

    async fn back_off_edge(&mut self, actuator: &mut dyn Actuator, shutdown: &CancellationToken) -> Result<()> {
        actuator.backward(self.config.speed)?;
        pause(Duration::from_millis(300), shutdown).await;
        actuator.stop()
    }

    async fn backup_and_turn(&mut self, actuator: &mut dyn Actuator, shutdown: &CancellationToken) -> Result<()> {
        actuator.stop()?;
        actuator.backward(self.config.speed)?;
        pause(Duration::from_millis(500), shutdown).await;

        let angle = self.random_angle(30, 60);
        actuator.steer(angle)?;
        actuator.backward(self.config.speed)?;
        pause(Duration::from_millis(500), shutdown).await;

        actuator.steer(0)?;
        actuator.stop()
    }

    async fn turn_slightly(&mut self, actuator: &mut dyn Actuator, shutdown: &CancellationToken) -> Result<()> {
        let angle = self.random_angle(10, 25);
        actuator.steer(angle)?;
        actuator.forward(self.config.speed)?;
        pause(Duration::from_millis(300), shutdown).await;
        actuator.steer(0)?;
        if self.config.movement == MovementStyle::Creep {
            actuator.stop()?;
        }
        Ok(())
    }

    async fn look_around(&mut self, actuator: &mut dyn Actuator, shutdown: &CancellationToken) -> Result<()> {
        actuator.pan(-45)?;
        pause(Duration::from_millis(400), shutdown).await;
        actuator.pan(45)?;
        pause(Duration::from_millis(400), shutdown).await;
        actuator.pan(0)
    }
}

/// Sleep unless shutdown comes first
async fn pause(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl Actuator for Recorder {
        fn forward(&mut self, speed: u8) -> Result<()> {
            self.0.push(format!("forward {speed}"));
            Ok(())
        }
        fn backward(&mut self, speed: u8) -> Result<()> {
            self.0.push(format!("backward {speed}"));
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            self.0.push("stop".to_string());
            Ok(())
        }
        fn steer(&mut self, angle: i32) -> Result<()> {
            self.0.push(format!("steer {angle}"));
            Ok(())
        }
        fn pan(&mut self, angle: i32) -> Result<()> {
            self.0.push(format!("pan {angle}"));
            Ok(())
        }
        fn tilt(&mut self, angle: i32) -> Result<()> {
            self.0.push(format!("tilt {angle}"));
            Ok(())
        }
    }

    /// Replays distance readings; cliff once the readings run out
    struct Floor {
        distances: VecDeque<f32>,
    }

    impl Sensors for Floor {
        fn distance_cm(&mut self) -> Result<f32> {
            self.distances
                .pop_front()
                .ok_or_else(|| Error::Hardware("exhausted".to_string()))
        }
        fn cliff_detected(&mut self) -> Result<bool> {
            Ok(self.distances.is_empty())
        }
    }

    #[derive(Default)]
    struct Hooks {
        wake_after: Option<usize>,
        app: bool,
        polls: usize,
    }

    #[async_trait]
    impl ExplorationHooks for Hooks {
        async fn on_thought(&mut self, _description: &str, _actuator: &mut dyn Actuator) -> Option<String> {
            None
        }
        async fn check_wake_word(&mut self) -> bool {
            self.polls += 1;
            self.wake_after.is_some_and(|n| self.polls > n)
        }
        fn check_app_input(&mut self) -> bool {
            self.app
        }
    }

    fn explorer() -> Explorer {
        let config = ExplorationConfig {
            thought_min: Duration::from_secs(600),
            thought_max: Duration::from_secs(600),
            ..ExplorationConfig::default()
        };
        Explorer::new(config, false).with_seed(7)
    }

    #[tokio::test]
    async fn test_cliff_stops_before_backing_off() {
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([80.0]),
        };
        let outcome = explorer()
            .explore(&mut car, &mut floor, None, &mut Hooks::default(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::TableMode);
        let cliff_at = car.0.iter().rposition(|c| c == "backward 20").unwrap();
        assert_eq!(car.0[cliff_at - 1], "stop");
        assert_eq!(&car.0[cliff_at + 1..], ["stop", "stop"]);
    }

    #[tokio::test]
    async fn test_wake_word_ends_exploration() {
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([80.0; 10]),
        };
        let mut hooks = Hooks {
            wake_after: Some(1),
            ..Hooks::default()
        };
        let outcome = explorer()
            .explore(&mut car, &mut floor, None, &mut hooks, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::WakeWord);
        assert!(car.0.contains(&"forward 20".to_string()));
        assert_eq!(car.0.last().map(String::as_str), Some("stop"));
    }

    #[tokio::test]
    async fn test_app_input_ends_exploration() {
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([80.0; 3]),
        };
        let mut hooks = Hooks {
            app: true,
            ..Hooks::default()
        };
        let outcome = explorer()
            .explore(&mut car, &mut floor, None, &mut hooks, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::AppControl);
    }

    #[tokio::test]
    async fn test_obstacle_triggers_backup() {
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([10.0]),
        };
        explorer()
            .explore(&mut car, &mut floor, None, &mut Hooks::default(), &CancellationToken::new())
            .await;
        assert_eq!(&car.0[..2], ["stop", "backward 20"]);
    }

    #[tokio::test]
    async fn test_pickup_detected_on_distance_jump() {
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([80.0, 3.0, 80.0]),
        };
        let outcome = Explorer::new(ExplorationConfig::default(), true)
            .explore(&mut car, &mut floor, None, &mut Hooks::default(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::ManualControl);
    }

    #[tokio::test]
    async fn test_shutdown_returns_immediately() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut car = Recorder::default();
        let mut floor = Floor {
            distances: VecDeque::from([80.0]),
        };
        let outcome = explorer()
            .explore(&mut car, &mut floor, None, &mut Hooks::default(), &shutdown)
            .await;
        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(car.0, ["stop"]);
    }
}
