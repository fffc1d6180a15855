// End-to-end checks of bus-level drivers against simulated chips
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hatkit_core::clock::VirtualClock;
use hatkit_core::device::{Device, Interface};
use hatkit_core::error::HatError;
use hatkit_library::drivers::expander::{Mcp23017Model, DEFAULT_ADDRESS as MCP_ADDRESS};
use hatkit_library::drivers::gpio::{Direction, Edge, EdgeCallback, EdgeEvent};
use hatkit_library::drivers::imu::{Ak09916Model, Icm20948Model, ImuField, AK09916_ADDRESS, ICM20948_ADDRESS};
use hatkit_library::drivers::pwm::PinPairLock;
use hatkit_library::drivers::servo::DEFAULT_ADDRESS as PCA_ADDRESS;
use hatkit_library::{
    shared_gpio, shared_i2c, Gpio, HardwarePwm, Icm20948, Icm20948Config, Mcp23017Config,
    Mcp23017Driver, Pca9685, Pca9685Config, RegisterMap, SimulationGpioDriver, SimulationI2cDriver,
    SimulationPwmDriver, Ultrasonic, UltrasonicConfig,
};

#[test]
fn ultrasonic_echo_converts_to_centimetres() {
    let clock = Arc::new(VirtualClock::new());
    let driver = SimulationGpioDriver::with_clock(clock.clone());
    driver
        .handle()
        .link_pulse("23", "24", Duration::ZERO, Duration::from_micros(5882));

    let config = UltrasonicConfig {
        poll_interval: Duration::from_micros(1),
        ..Default::default()
    };
    let mut sonar = Ultrasonic::with_gpio(shared_gpio(driver), config).with_clock(clock);
    sonar.start().unwrap();

    let cm = sonar.read().unwrap();
    assert!((97.3..=97.5).contains(&cm), "measured {} cm", cm);
    assert_eq!(sonar.latest().map(|r| r.distance_cm), Some(cm));
    sonar.stop().unwrap();
}

#[test]
fn pca9685_half_duty_at_50hz() {
    let chip = RegisterMap::new();
    let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(PCA_ADDRESS, chip.clone()));
    let mut pca = Pca9685::with_bus(bus, Pca9685Config::default());
    pca.start().unwrap();
    assert_eq!(chip.get(0xFE), 121);

    pca.write(0, 0.5).unwrap();
    // LED0_ON_L..LED0_OFF_H
    assert_eq!(chip.get(0x06), 0x00);
    assert_eq!(chip.get(0x07), 0x00);
    assert_eq!(chip.get(0x08), 0x00);
    assert_eq!(chip.get(0x09), 0x08);
    pca.stop().unwrap();
}

fn count_edge(_event: &EdgeEvent, context: &(dyn std::any::Any + Send + Sync)) {
    if let Some(counter) = context.downcast_ref::<AtomicUsize>() {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn mcp23017_debounce_swallows_bounce() {
    let model = Mcp23017Model::new();
    let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(MCP_ADDRESS, model.clone()));
    let mut mcp = Mcp23017Driver::new(bus, Mcp23017Config::default()).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    mcp.configure("A_0", Direction::Input, None).unwrap();
    mcp.set_debounce("A_0", 200).unwrap();
    mcp.on_event("A_0", Some(EdgeCallback::new(count_edge, hits.clone())))
        .unwrap();
    mcp.set_edge("A_0", Some(Edge::Rising)).unwrap();

    // two rising edges 50 ms apart
    model.set_input("A_0", 1).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    model.set_input("A_0", 0).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    model.set_input("A_0", 1).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // the window has elapsed; the next edge goes through
    std::thread::sleep(Duration::from_millis(200));
    model.set_input("A_0", 0).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    model.set_input("A_0", 1).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    mcp.close().unwrap();
}

#[test]
fn imu_at_rest_reads_one_g() {
    let chip = Icm20948Model::new();
    let bus = shared_i2c(
        SimulationI2cDriver::new(1)
            .with_device(ICM20948_ADDRESS, chip)
            .with_device(AK09916_ADDRESS, Ak09916Model::new()),
    );
    let mut imu = Icm20948::with_bus(bus, Icm20948Config::default());
    imu.start().unwrap();

    for _ in 0..100 {
        let accel = imu.read(&[ImuField::Accel]).unwrap().accel.unwrap();
        let magnitude = accel.iter().map(|a| a * a).sum::<f64>().sqrt();
        assert!((0.9..=1.1).contains(&magnitude), "|a| = {}", magnitude);
    }
    imu.stop().unwrap();
}

#[test]
fn hardware_pwm_pin_rules() {
    let lock = PinPairLock::new();

    let err = SimulationPwmDriver::with_lock(17, &lock).err().unwrap();
    assert!(matches!(err, HatError::InvalidPwmPin { pin: 17, .. }));

    let mut first = SimulationPwmDriver::with_lock(18, &lock).unwrap();
    let _second = SimulationPwmDriver::with_lock(19, &lock).unwrap();
    let err = SimulationPwmDriver::with_lock(12, &lock).err().unwrap();
    assert!(matches!(err, HatError::InvalidPwmPin { pin: 12, .. }));

    first.set_frequency(50.0).unwrap();
    first.set_duty(0.075).unwrap();
    first.enable(true).unwrap();
    assert!(first.is_enabled());
}
