//! Hardware collaborators: potentiometer, servo and status display
//!
//! The link core only sees the three traits at the top of this module.
//! The concrete types model the SmartMotor boards (12-bit ADC knob, 50 Hz
//! hobby servo, 4x16 character display) plus simulated stand-ins used by
//! the CLI and the tests.
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use log::info;
use rand::Rng;

use crate::contracts::Role;
use crate::errors::HardwareError;
use crate::session::LinkState;

/// Source of the angle the controller streams
pub trait Sensor: Send {
    fn read(&mut self) -> Result<f32, HardwareError>;
}

/// Output the receiver drives
pub trait Actuator: Send {
    fn write(&mut self, angle: f32) -> Result<(), HardwareError>;

    /// Last position actually commanded, if any
    fn position(&self) -> Option<f32>;
}

/// What a device shows about its link
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayStatus {
    pub role: Role,
    pub state: LinkState,
    pub sequence: Option<u16>,
    pub value: Option<f32>,
    /// Round-trip time of the last confirmed value (controller only)
    pub rtt_ms: Option<u64>,
}

/// Status output; failures are logged by callers, never propagated
pub trait StatusDisplay: Send {
    fn show(&mut self, status: &DisplayStatus) -> Result<(), HardwareError>;
}

// ---------------------------------------------------------------------------
// Potentiometer
// ---------------------------------------------------------------------------

/// Full-scale reading of the 12-bit ADC
pub const ADC_MAX: u16 = 4095;

/// Samples averaged per reading to take the edge off ADC noise
const ADC_SAMPLES: u32 = 3;

/// Raw ADC channel
pub trait AdcChannel: Send {
    fn read_raw(&mut self) -> Result<u16, HardwareError>;
}

/// Potentiometer on an ADC pin, mapped linearly onto 0..=180 degrees
pub struct AdcAngleSensor<A: AdcChannel> {
    adc: A,
}

impl<A: AdcChannel> AdcAngleSensor<A> {
    pub fn new(adc: A) -> Self {
        Self { adc }
    }

    pub fn raw_to_angle(raw: u16) -> f32 {
        let raw = raw.min(ADC_MAX) as f32;
        (raw * 180.0 / ADC_MAX as f32).clamp(0.0, 180.0)
    }
}

impl<A: AdcChannel> Sensor for AdcAngleSensor<A> {
    fn read(&mut self) -> Result<f32, HardwareError> {
        let mut total = 0u32;
        for _ in 0..ADC_SAMPLES {
            total += self.adc.read_raw()? as u32;
        }
        Ok(Self::raw_to_angle((total / ADC_SAMPLES) as u16))
    }
}

/// Hand on a knob: slow random drift with ADC noise on top
pub struct SimulatedKnob {
    position: f32,
    drift: f32,
    noise: f32,
}

impl SimulatedKnob {
    /// Start at `raw` with up to `drift` counts of movement per read
    pub fn new(raw: u16, drift: f32) -> Self {
        Self {
            position: raw.min(ADC_MAX) as f32,
            drift,
            noise: 8.0,
        }
    }
}

impl AdcChannel for SimulatedKnob {
    fn read_raw(&mut self) -> Result<u16, HardwareError> {
        let mut rng = rand::thread_rng();
        if self.drift > 0.0 {
            self.position = (self.position + rng.gen_range(-self.drift..=self.drift))
                .clamp(0.0, ADC_MAX as f32);
        }
        let noisy = self.position + rng.gen_range(-self.noise..=self.noise);
        Ok(noisy.clamp(0.0, ADC_MAX as f32) as u16)
    }
}

// ---------------------------------------------------------------------------
// Servo
// ---------------------------------------------------------------------------

/// Moves smaller than this are not worth a PWM update
const SERVO_MIN_STEP: f32 = 1.0;

/// Pulse-width model of a hobby servo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoModel {
    pub min_us: u32,
    pub max_us: u32,
    pub freq_hz: u32,
    /// Mechanical travel in degrees
    pub range: f32,
}

impl Default for ServoModel {
    fn default() -> Self {
        Self {
            min_us: 600,
            max_us: 2400,
            freq_hz: 50,
            range: 180.0,
        }
    }
}

impl ServoModel {
    /// Pulse width for an angle, clamped to the travel
    pub fn pulse_us(&self, angle: f32) -> u32 {
        let angle = angle.clamp(0.0, self.range);
        let span = (self.max_us - self.min_us) as f32;
        self.min_us + (span * angle / self.range).round() as u32
    }

    /// 10-bit duty cycle for an angle
    pub fn duty(&self, angle: f32) -> u16 {
        let pulse = self.pulse_us(angle) as u64;
        (pulse * 1024 * self.freq_hz as u64 / 1_000_000) as u16
    }
}

/// PWM pin driving a servo
pub trait PwmOutput: Send {
    fn set_duty(&mut self, duty: u16) -> Result<(), HardwareError>;
}

/// Servo on a PWM pin
pub struct Servo<P: PwmOutput> {
    model: ServoModel,
    pwm: P,
    position: Option<f32>,
}

impl<P: PwmOutput> Servo<P> {
    pub fn new(model: ServoModel, pwm: P) -> Self {
        Self {
            model,
            pwm,
            position: None,
        }
    }
}

impl<P: PwmOutput> Actuator for Servo<P> {
    fn write(&mut self, angle: f32) -> Result<(), HardwareError> {
        if !angle.is_finite() {
            return Err(HardwareError::Actuator(format!("refusing angle {}", angle)));
        }
        if let Some(current) = self.position {
            if (current - angle).abs() < SERVO_MIN_STEP {
                return Ok(());
            }
        }
        self.pwm.set_duty(self.model.duty(angle))?;
        self.position = Some(angle);
        Ok(())
    }

    fn position(&self) -> Option<f32> {
        self.position
    }
}

/// PWM pin that records the duty and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct SimulatedPwm {
    duty: Arc<AtomicU16>,
    fail: Arc<AtomicBool>,
}

impl SimulatedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty(&self) -> u16 {
        self.duty.load(Ordering::SeqCst)
    }

    /// Simulate a stalled or disconnected servo
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PwmOutput for SimulatedPwm {
    fn set_duty(&mut self, duty: u16) -> Result<(), HardwareError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HardwareError::Actuator("servo not responding".to_string()));
        }
        self.duty.store(duty, Ordering::SeqCst);
        Ok(())
    }
}

pub type SimulatedServo = Servo<SimulatedPwm>;

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

pub const DISPLAY_LINES: usize = 4;
pub const DISPLAY_COLUMNS: usize = 16;

/// Render a status into the lines of a 4x16 character display
pub fn render_status(status: &DisplayStatus) -> [String; DISPLAY_LINES] {
    let fit = |text: String| text.chars().take(DISPLAY_COLUMNS).collect::<String>();
    let value = match status.value {
        Some(angle) => format!("Angle: {:.0}", angle),
        None => "Angle: --".to_string(),
    };
    let detail = match (status.sequence, status.rtt_ms) {
        (Some(seq), Some(rtt)) => format!("#{} {}ms", seq, rtt),
        (Some(seq), None) => format!("Seq: {}", seq),
        (None, _) => String::new(),
    };
    [
        fit(format!("SmartMotor {}", status.role.name())),
        fit(status.state.to_string()),
        fit(value),
        fit(detail),
    ]
}

/// Display that writes to the log, only when the content changes
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    lines: Option<[String; DISPLAY_LINES]>,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Option<&[String; DISPLAY_LINES]> {
        self.lines.as_ref()
    }
}

impl StatusDisplay for ConsoleDisplay {
    fn show(&mut self, status: &DisplayStatus) -> Result<(), HardwareError> {
        let lines = render_status(status);
        if self.lines.as_ref() != Some(&lines) {
            info!("[{}]", lines.join(" | "));
            self.lines = Some(lines);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdc(Vec<u16>);

    impl AdcChannel for FixedAdc {
        fn read_raw(&mut self) -> Result<u16, HardwareError> {
            self.0
                .pop()
                .ok_or_else(|| HardwareError::Sensor("adc empty".to_string()))
        }
    }

    #[test]
    fn test_adc_mapping() {
        assert_eq!(AdcAngleSensor::<FixedAdc>::raw_to_angle(0), 0.0);
        assert_eq!(AdcAngleSensor::<FixedAdc>::raw_to_angle(ADC_MAX), 180.0);
        assert_eq!(AdcAngleSensor::<FixedAdc>::raw_to_angle(u16::MAX), 180.0);
    }

    #[test]
    fn test_adc_sensor_averages_three_samples() {
        let mut sensor = AdcAngleSensor::new(FixedAdc(vec![4095, 0, 2048]));
        let angle = sensor.read().unwrap();
        assert!((angle - 90.0).abs() < 0.5, "got {}", angle);
    }

    #[test]
    fn test_adc_failure_propagates() {
        let mut sensor = AdcAngleSensor::new(FixedAdc(vec![1, 2]));
        assert!(matches!(sensor.read(), Err(HardwareError::Sensor(_))));
    }

    #[test]
    fn test_simulated_knob_stays_in_range() {
        let mut knob = SimulatedKnob::new(ADC_MAX, 50.0);
        for _ in 0..500 {
            assert!(knob.read_raw().unwrap() <= ADC_MAX);
        }
    }

    #[test]
    fn test_servo_duty() {
        let model = ServoModel::default();
        assert_eq!(model.pulse_us(0.0), 600);
        assert_eq!(model.pulse_us(180.0), 2400);
        assert_eq!(model.pulse_us(90.0), 1500);
        // 1500us at 50Hz on a 10-bit scale
        assert_eq!(model.duty(90.0), 76);
    }

    #[test]
    fn test_servo_skips_tiny_moves() {
        let pwm = SimulatedPwm::new();
        let mut servo = Servo::new(ServoModel::default(), pwm.clone());
        servo.write(90.0).unwrap();
        let duty = pwm.duty();
        servo.write(90.5).unwrap();
        assert_eq!(servo.position(), Some(90.0));
        assert_eq!(pwm.duty(), duty);
        servo.write(180.0).unwrap();
        assert_eq!(servo.position(), Some(180.0));
    }

    #[test]
    fn test_servo_fault() {
        let pwm = SimulatedPwm::new();
        let mut servo = Servo::new(ServoModel::default(), pwm.clone());
        pwm.set_failing(true);
        assert!(matches!(servo.write(45.0), Err(HardwareError::Actuator(_))));
        assert_eq!(servo.position(), None);
    }

    #[test]
    fn test_render_fits_display() {
        let status = DisplayStatus {
            role: Role::Controller,
            state: LinkState::Connected,
            sequence: Some(65535),
            value: Some(123.4),
            rtt_ms: Some(12345),
        };
        let lines = render_status(&status);
        assert!(lines.iter().all(|l| l.chars().count() <= DISPLAY_COLUMNS));
        assert_eq!(lines[1], "CONNECTED");
        assert_eq!(lines[2], "Angle: 123");
    }
}
