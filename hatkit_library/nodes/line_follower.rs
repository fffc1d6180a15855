//! Closed-loop line follower
//!
//! A control thread samples the line sensor at a fixed rate, turns the
//! five channel bits into a lateral error, runs it through a PID law and
//! drives the motor controller differentially. Losing the line for long
//! enough brakes the robot and ends the loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use hatkit_core::buffer::ObservationBuffer;
use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::DriverStatus;
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use crate::drivers::line_sensor::{LineMode, LineSensor};
use crate::drivers::motor::MotorController;
use crate::messages::control::{DifferentialDriveCommand, PidConfig};
use crate::messages::sensor::{stamp_now, LineSample};

/// Lateral position of each channel, left to right
pub const CHANNEL_WEIGHTS: [f64; 5] = [-4.5, -2.5, 0.0, 2.5, 4.5];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFollowerConfig {
    pub pid: PidConfig,
    /// Forward duty both wheels share, in `[-1, 1]`
    pub base_speed: f64,
    pub rate_hz: f64,
    /// Time without any channel on the line before braking
    pub lost_timeout: Duration,
    /// Samples averaged for the derivative term
    pub derivative_window: usize,
}

impl Default for LineFollowerConfig {
    fn default() -> Self {
        Self {
            pid: PidConfig::default(),
            base_speed: 0.3,
            rate_hz: 20.0,
            lost_timeout: Duration::from_millis(800),
            derivative_window: 4,
        }
    }
}

impl LineFollowerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

/// One control tick, as recorded in the follower's observation buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSample {
    pub stamp_nanos: u64,
    pub line: LineSample,
    pub error: f64,
    pub output: f64,
    pub command: Option<DifferentialDriveCommand>,
}

/// What the law asks the motors to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Steering {
    Drive {
        error: f64,
        output: f64,
        left: f64,
        right: f64,
    },
    /// No channel sees the line; keep the last command for now
    Searching,
    /// The line has been gone for the configured timeout
    Lost,
}

/// PID steering law; pure state machine, no I/O
#[derive(Debug, Clone)]
pub struct LineController {
    config: LineFollowerConfig,
    mode: LineMode,
    integral: f64,
    previous: Option<f64>,
    derivatives: VecDeque<f64>,
    lost_since: Option<Duration>,
}

impl LineController {
    pub fn new(config: LineFollowerConfig, mode: LineMode) -> Self {
        Self {
            config,
            mode,
            integral: 0.0,
            previous: None,
            derivatives: VecDeque::with_capacity(config.derivative_window),
            lost_since: None,
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous = None;
        self.derivatives.clear();
        self.lost_since = None;
    }

    /// Weighted mean position of the active channels
    pub fn error(&self, sample: &LineSample) -> Option<f64> {
        let active = sample.active();
        if active == 0 {
            return None;
        }
        let sum: f64 = sample
            .channels
            .iter()
            .zip(CHANNEL_WEIGHTS)
            .filter(|(&bit, _)| bit != 0)
            .map(|(_, w)| w)
            .sum();
        let error = sum / active as f64;
        Some(match self.mode {
            LineMode::Dark => error,
            LineMode::Bright => -error,
        })
    }

    /// Advance by one sample taken at `now`, `dt` seconds after the last
    pub fn step(&mut self, sample: &LineSample, now: Duration, dt: f64) -> Steering {
        let Some(error) = self.error(sample) else {
            let since = *self.lost_since.get_or_insert(now);
            if now.saturating_sub(since) >= self.config.lost_timeout {
                return Steering::Lost;
            }
            return Steering::Searching;
        };
        self.lost_since = None;
        let pid = &self.config.pid;

        let limit = pid.integral_limit.abs();
        self.integral += pid.ki * error * dt;
        if self.integral.abs() > limit {
            self.integral = 0.9 * self.integral.signum() * limit;
        }

        let raw = match self.previous {
            Some(previous) if dt > 0.0 => (error - previous) / dt,
            _ => 0.0,
        };
        self.previous = Some(error);
        if self.derivatives.len() >= self.config.derivative_window.max(1) {
            self.derivatives.pop_front();
        }
        self.derivatives.push_back(raw);
        let derivative = self.derivatives.iter().sum::<f64>() / self.derivatives.len() as f64;

        let output = pid.kp * error + self.integral + pid.kd * derivative;
        let base = self.config.base_speed;
        Steering::Drive {
            error,
            output,
            left: (base + output).clamp(-1.0, 1.0),
            right: (base - output).clamp(-1.0, 1.0),
        }
    }
}

struct Shared {
    sensor: Mutex<LineSensor>,
    motor: Mutex<MotorController>,
}

/// Line sensor and motor controller tied together by a control thread
pub struct LineFollower {
    base: DeviceBase<ControlSample>,
    config: LineFollowerConfig,
    devices: Arc<Shared>,
    clock: Arc<dyn Clock>,
    running: Event,
    worker: Option<JoinHandle<()>>,
}

impl LineFollower {
    pub fn new(sensor: LineSensor, motor: MotorController, config: LineFollowerConfig) -> Self {
        Self {
            base: DeviceBase::new("line_follower"),
            config,
            devices: Arc::new(Shared {
                sensor: Mutex::new(sensor),
                motor: Mutex::new(motor),
            }),
            clock: SystemClock::shared(),
            running: Event::new(),
            worker: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LineFollowerConfig {
        &self.config
    }

    /// Control ticks so far, oldest first
    pub fn samples(&self) -> ObservationBuffer<ControlSample> {
        self.base.buffer().clone()
    }

    pub fn is_following(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Send the CAL pulse train that starts the sensor's calibration sweep
    pub fn calibrate(&mut self) -> HatResult<()> {
        if self.is_following() {
            return Err(HatError::invalid_input("cannot calibrate while following"));
        }
        self.devices.sensor.lock().calibrate()
    }

    fn spawn(&mut self) -> HatResult<()> {
        let devices = Arc::clone(&self.devices);
        let clock = Arc::clone(&self.clock);
        let running = self.running.clone();
        let samples = self.base.buffer().clone();
        let config = self.config;
        let mode = devices.sensor.lock().mode();

        running.set();
        let worker = std::thread::Builder::new()
            .name("line-follower".to_string())
            .spawn(move || {
                control_loop(&devices, clock.as_ref(), &running, &samples, config, mode);
                running.set();
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn launch(&mut self) -> HatResult<()> {
        self.devices.sensor.lock().start()?;
        self.devices.motor.lock().start()?;
        self.spawn()
    }

    fn halt(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.running.clear();
        if !worker.is_finished() && !self.running.wait_timeout(self.config.period() * 4) {
            log::warn!("line follower: control thread did not confirm exit");
        }
        if worker.join().is_err() {
            log::error!("line follower: control thread panicked");
        }
        self.running.clear();
    }
}

fn control_loop(
    devices: &Shared,
    clock: &dyn Clock,
    running: &Event,
    samples: &ObservationBuffer<ControlSample>,
    config: LineFollowerConfig,
    mode: LineMode,
) {
    let mut law = LineController::new(config, mode);
    let period = config.period();
    let mut last = clock.now();
    let mut next = last;
    log::info!("line follower: running at {} Hz ({:?} line)", config.rate_hz, mode);

    while running.is_set() {
        let now = clock.now();
        let dt = now.saturating_sub(last).as_secs_f64();
        last = now;

        let line = match devices.sensor.lock().read() {
            Ok(line) => line,
            Err(e) => {
                log::error!("line follower: sensor read failed: {}", e);
                break;
            }
        };
        let steering = law.step(&line, now, dt);
        let (error, output, command) = match steering {
            Steering::Drive {
                error,
                output,
                left,
                right,
            } => {
                let mut motor = devices.motor.lock();
                if let Err(e) = motor.write(left, right, false) {
                    log::error!("line follower: motor write failed: {}", e);
                    break;
                }
                (error, output, motor.last_command())
            }
            Steering::Searching => (0.0, 0.0, None),
            Steering::Lost => {
                log::warn!("line follower: line lost for {:?}, stopping", config.lost_timeout);
                break;
            }
        };
        samples.append(ControlSample {
            stamp_nanos: stamp_now(),
            line,
            error,
            output,
            command,
        });

        next += period;
        let now = clock.now();
        if next > now {
            clock.sleep(next - now);
        } else {
            // overran; realign instead of bursting to catch up
            next = now;
        }
    }
    if let Err(e) = devices.motor.lock().brake() {
        log::warn!("line follower: brake failed: {}", e);
    }
}

impl Device for LineFollower {
    fn name(&self) -> &str {
        self.base.name()
    }

    /// Start both devices and the control thread
    fn start(&mut self) -> HatResult<()> {
        if self.is_following() {
            return Ok(());
        }
        self.halt();
        if let Err(e) = self.launch() {
            self.base.fail(&e);
            return Err(e);
        }
        self.base.set_status(DriverStatus::Running);
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        self.halt();
        let _ = self.devices.motor.lock().stop();
        let _ = self.devices.sensor.lock().stop();
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        match self.base.status() {
            DriverStatus::Running if !self.is_following() => DriverStatus::Ready,
            status => status,
        }
    }
}

impl Drop for LineFollower {
    fn drop(&mut self) {
        self.halt();
    }
}
