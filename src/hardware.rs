//! Hardware seams
//!
//! Motors, servos, sensors, the control pad, the user button and the status
//! LED are reached only through these traits. The vendor SDK is plugged in
//! by implementing them; the defaults here log or report "nothing happened"
//! so the voice loop runs on a bare desk.

use crate::Result;

/// Camera tilt the head returns to when idle
pub const DEFAULT_TILT: i32 = 20;

/// Readings below this are sensor failures, not obstacles
const MIN_RELIABLE_CM: f32 = 2.0;

/// Distance reported when the sensor cannot be read
pub const ASSUMED_CLEAR_CM: f32 = 100.0;

/// Drive motors, steering and the camera head
pub trait Actuator: Send {
    /// Drive forward at `speed` percent
    ///
    /// # Errors
    ///
    /// Returns error if the motor controller rejects the command
    fn forward(&mut self, speed: u8) -> Result<()>;

    /// Drive backward at `speed` percent
    ///
    /// # Errors
    ///
    /// Returns error if the motor controller rejects the command
    fn backward(&mut self, speed: u8) -> Result<()>;

    /// Stop both drive motors
    ///
    /// # Errors
    ///
    /// Returns error if the motor controller rejects the command
    fn stop(&mut self) -> Result<()>;

    /// Set the steering servo angle in degrees, negative is left
    ///
    /// # Errors
    ///
    /// Returns error if the servo cannot be set
    fn steer(&mut self, angle: i32) -> Result<()>;

    /// Set the camera pan angle in degrees, negative is left
    ///
    /// # Errors
    ///
    /// Returns error if the servo cannot be set
    fn pan(&mut self, angle: i32) -> Result<()>;

    /// Set the camera tilt angle in degrees, negative is down
    ///
    /// # Errors
    ///
    /// Returns error if the servo cannot be set
    fn tilt(&mut self, angle: i32) -> Result<()>;
}

/// Out-of-band motor cut used when the process is forced down
///
/// Called from the signal task while the main loop may still hold the
/// actuator, so implementations must not need `&mut`.
pub trait EmergencyStop: Send + Sync {
    fn stop_now(&self);
}

/// Ultrasonic distance and grayscale cliff sensing
pub trait Sensors: Send {
    /// Distance to the nearest obstacle ahead
    ///
    /// # Errors
    ///
    /// Returns error if the sensor cannot be read
    fn distance_cm(&mut self) -> Result<f32>;

    /// Whether the grayscale sensors see an edge
    ///
    /// # Errors
    ///
    /// Returns error if the sensor cannot be read
    fn cliff_detected(&mut self) -> Result<bool>;
}

/// Distance with failed or implausible readings mapped to "clear"
pub fn read_distance(sensors: &mut dyn Sensors) -> f32 {
    match sensors.distance_cm() {
        Ok(cm) if cm >= MIN_RELIABLE_CM => cm,
        Ok(cm) => {
            tracing::trace!(cm, "implausible distance reading");
            ASSUMED_CLEAR_CM
        }
        Err(e) => {
            tracing::debug!(error = %e, "distance read failed");
            ASSUMED_CLEAR_CM
        }
    }
}

/// Cliff check with read failures treated as "no edge"
pub fn read_cliff(sensors: &mut dyn Sensors) -> bool {
    sensors.cliff_detected().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cliff sensor read failed");
        false
    })
}

/// Where pad input comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadOrigin {
    /// The phone app took over the robot
    App,
    /// Someone is steering while the robot keeps talking
    Manual,
}

/// One poll of the remote control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadInput {
    pub origin: PadOrigin,
    /// Drive joystick `(x, y)`, each in -100..=100
    pub drive: Option<(i32, i32)>,
    /// Camera joystick `(pan, tilt)` in degrees
    pub camera: Option<(i32, i32)>,
    pub horn: bool,
    /// Re-center the camera
    pub recenter: bool,
}

impl PadInput {
    /// Nothing pressed
    #[must_use]
    pub const fn idle(origin: PadOrigin) -> Self {
        Self {
            origin,
            drive: None,
            camera: None,
            horn: false,
            recenter: false,
        }
    }

    /// Whether the drive stick is pushed past `deadband`
    #[must_use]
    pub fn is_driving(&self, deadband: i32) -> bool {
        self.drive
            .is_some_and(|(x, y)| x.abs() > deadband || y.abs() > deadband)
    }

    /// Whether anything on the pad counts as deliberate input
    #[must_use]
    pub fn is_active(&self, deadband: i32) -> bool {
        self.is_driving(deadband) || self.camera.is_some() || self.horn || self.recenter
    }
}

/// Remote control (phone app or gamepad)
pub trait ControlPad: Send {
    /// Latest input, or `None` when nothing is connected
    fn poll(&mut self) -> Option<PadInput>;
}

/// Physical push-to-talk button
pub trait Button: Send {
    fn is_pressed(&mut self) -> bool;
}

/// Single status LED
pub trait StatusLed: Send {
    fn set(&mut self, on: bool);
}

/// Put the car into a safe resting pose
///
/// Every step is attempted even if an earlier one fails.
pub fn reset_safe(actuator: &mut dyn Actuator) {
    let steps: [(&str, Result<()>); 4] = [
        ("stop", actuator.stop()),
        ("steer", actuator.steer(0)),
        ("pan", actuator.pan(0)),
        ("tilt", actuator.tilt(DEFAULT_TILT)),
    ];
    for (step, result) in steps {
        if let Err(e) = result {
            tracing::warn!(step, error = %e, "safe reset step failed");
        }
    }
}

/// Stop the motors, logging instead of failing
pub fn stop_motion(actuator: &mut dyn Actuator) {
    if let Err(e) = actuator.stop() {
        tracing::warn!(error = %e, "failed to stop motors");
    }
}

/// Apply pad input to the car
///
/// Steering maps the x axis onto -30..=30 degrees. Speeds inside the
/// deadband stop the motors. Camera angles are clamped to the head's range.
pub fn apply_pad(actuator: &mut dyn Actuator, input: &PadInput, deadband: i32) -> Result<()> {
    if input.recenter {
        actuator.pan(0)?;
        actuator.tilt(0)?;
    }

    if let Some((x, y)) = input.drive {
        actuator.steer(x.clamp(-100, 100) * 30 / 100)?;
        let speed = speed_percent(y);
        if y > deadband {
            actuator.forward(speed)?;
        } else if y < -deadband {
            actuator.backward(speed)?;
        } else {
            actuator.stop()?;
        }
    }

    if let Some((pan, tilt)) = input.camera {
        actuator.pan(pan.clamp(-90, 90))?;
        actuator.tilt(tilt.clamp(-35, 65))?;
    }
    Ok(())
}

fn speed_percent(y: i32) -> u8 {
    u8::try_from(y.unsigned_abs().min(100)).unwrap_or(100)
}

/// Actuator that only logs what it would do
#[derive(Debug, Default)]
pub struct LoggingActuator;

impl Actuator for LoggingActuator {
    fn forward(&mut self, speed: u8) -> Result<()> {
        tracing::info!(speed, "forward");
        Ok(())
    }

    fn backward(&mut self, speed: u8) -> Result<()> {
        tracing::info!(speed, "backward");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        tracing::debug!("stop");
        Ok(())
    }

    fn steer(&mut self, angle: i32) -> Result<()> {
        tracing::debug!(angle, "steer");
        Ok(())
    }

    fn pan(&mut self, angle: i32) -> Result<()> {
        tracing::debug!(angle, "pan");
        Ok(())
    }

    fn tilt(&mut self, angle: i32) -> Result<()> {
        tracing::debug!(angle, "tilt");
        Ok(())
    }
}

impl EmergencyStop for LoggingActuator {
    fn stop_now(&self) {
        tracing::warn!("emergency stop");
    }
}

/// Sensors that always report open floor
#[derive(Debug, Default)]
pub struct NullSensors;

impl Sensors for NullSensors {
    fn distance_cm(&mut self) -> Result<f32> {
        Ok(ASSUMED_CLEAR_CM)
    }

    fn cliff_detected(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// No remote control connected
#[derive(Debug, Default)]
pub struct NoPad;

impl ControlPad for NoPad {
    fn poll(&mut self) -> Option<PadInput> {
        None
    }
}

/// No button fitted
#[derive(Debug, Default)]
pub struct NoButton;

impl Button for NoButton {
    fn is_pressed(&mut self) -> bool {
        false
    }
}

/// LED that only logs its state
#[derive(Debug, Default)]
pub struct LoggingLed;

impl StatusLed for LoggingLed {
    fn set(&mut self, on: bool) {
        tracing::trace!(on, "led");
    }
}
