//! Status LED patterns
//!
//! Blinking patterns run on a background task. Every pattern change bumps a
//! generation number under the LED lock, so a task from an older pattern
//! can never flip the LED after a newer pattern took over.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::hardware::StatusLed;

/// What the LED is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    /// Fast blink while waiting on the model
    Thinking,
    /// Slow pulse while speaking
    Talking,
    /// Solid on while recording
    Listening,
    /// Off while waiting for the wake word
    Idle,
}

impl LedPattern {
    /// `(on, off)` times for blinking patterns
    const fn timing(self) -> Option<(Duration, Duration)> {
        match self {
            Self::Thinking => Some((Duration::from_millis(150), Duration::from_millis(150))),
            Self::Talking => Some((Duration::from_millis(300), Duration::from_millis(700))),
            Self::Listening | Self::Idle => None,
        }
    }
}

struct Shared {
    led: Box<dyn StatusLed>,
    generation: u64,
}

/// Drives the status LED
pub struct LedIndicator {
    shared: Arc<Mutex<Shared>>,
    pattern: LedPattern,
    task: Option<JoinHandle<()>>,
}

impl LedIndicator {
    #[must_use]
    pub fn new(mut led: Box<dyn StatusLed>) -> Self {
        led.set(false);
        Self {
            shared: Arc::new(Mutex::new(Shared { led, generation: 0 })),
            pattern: LedPattern::Idle,
            task: None,
        }
    }

    #[must_use]
    pub const fn pattern(&self) -> LedPattern {
        self.pattern
    }

    /// Switch to `pattern`; showing the current pattern again is a no-op
    pub fn show(&mut self, pattern: LedPattern) {
        if pattern == self.pattern {
            return;
        }
        self.pattern = pattern;
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let generation = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.generation += 1;
            shared.led.set(pattern == LedPattern::Listening);
            shared.generation
        };
        tracing::trace!(?pattern, "led pattern");

        if let Some((on, off)) = pattern.timing() {
            let shared = Arc::clone(&self.shared);
            self.task = Some(tokio::spawn(blink(shared, generation, on, off)));
        }
    }
}

impl Drop for LedIndicator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.generation += 1;
        shared.led.set(false);
    }
}

async fn blink(shared: Arc<Mutex<Shared>>, generation: u64, on: Duration, off: Duration) {
    let mut lit = false;
    loop {
        lit = !lit;
        {
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.generation != generation {
                return;
            }
            shared.led.set(lit);
        }
        tokio::time::sleep(if lit { on } else { off }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct LedLog(Arc<Mutex<Vec<bool>>>);

    impl StatusLed for LedLog {
        fn set(&mut self, on: bool) {
            self.0.lock().unwrap().push(on);
        }
    }

    #[tokio::test]
    async fn test_listening_is_solid_on() {
        let log = LedLog::default();
        let mut led = LedIndicator::new(Box::new(log.clone()));
        led.show(LedPattern::Listening);
        assert_eq!(*log.0.lock().unwrap(), [false, true]);
        assert_eq!(led.pattern(), LedPattern::Listening);
    }

    #[tokio::test]
    async fn test_blink_stops_on_pattern_change() {
        let log = LedLog::default();
        let mut led = LedIndicator::new(Box::new(log.clone()));
        led.show(LedPattern::Thinking);
        tokio::time::sleep(Duration::from_millis(400)).await;
        led.show(LedPattern::Idle);

        let writes = log.0.lock().unwrap().len();
        assert!(writes >= 3, "blinked {writes} times");
        assert_eq!(log.0.lock().unwrap().last(), Some(&false));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(log.0.lock().unwrap().len(), writes);
    }

    #[tokio::test]
    async fn test_drop_turns_led_off() {
        let log = LedLog::default();
        {
            let mut led = LedIndicator::new(Box::new(log.clone()));
            led.show(LedPattern::Listening);
        }
        assert_eq!(log.0.lock().unwrap().last(), Some(&false));
    }
}
