#[cfg(feature = "demo-signals")]
use crate::clock::Clock;
#[cfg(feature = "demo-signals")]
use crate::producer::SignalDistributor;
#[cfg(feature = "demo-signals")]
use clap::ValueEnum;
#[cfg(feature = "demo-signals")]
use rand::Rng;
#[cfg(feature = "demo-signals")]
use std::sync::Arc;
#[cfg(feature = "demo-signals")]
use tokio::time::{sleep, Duration};
#[cfg(feature = "demo-signals")]
use vesper_common::{SignalValue, DEFAULT_FETCH_REQUEST_ID};

/// Well-known signal ids used by the synthetic generator; a demo scheme file
/// references the same ids.
#[cfg(feature = "demo-signals")]
pub const DEMO_SPEED_SIGNAL: u32 = 1001;
#[cfg(feature = "demo-signals")]
pub const DEMO_RPM_SIGNAL: u32 = 1002;
#[cfg(feature = "demo-signals")]
pub const DEMO_BRAKE_SIGNAL: u32 = 1003;

#[cfg(feature = "demo-signals")]
#[derive(Clone, ValueEnum, Debug)]
#[value(rename_all = "kebab-case")]
pub enum DemoProfile {
    /// Steady highway driving with gentle speed drift.
    Cruise,
    /// Stop-and-go traffic with braking bursts.
    City,
}

/// Push synthetic speed/RPM/brake samples through the producer API forever.
#[cfg(feature = "demo-signals")]
pub async fn run_demo(profile: DemoProfile, distributor: Arc<SignalDistributor>, clock: Clock) {
    let mut tick: u64 = 0;
    loop {
        let (speed, braking) = {
            let mut rng = rand::thread_rng();
            match profile {
                DemoProfile::Cruise => {
                    let drift: f64 = rng.gen_range(-1.5..1.5);
                    (110.0 + 8.0 * (tick as f64 / 40.0).sin() + drift, false)
                }
                DemoProfile::City => {
                    let phase = (tick / 50) % 2;
                    let base = if phase == 0 { 45.0 } else { 8.0 };
                    (base + rng.gen_range(-4.0..4.0), phase == 1 && tick % 50 < 10)
                }
            }
        };
        let speed = speed.max(0.0);
        let rpm = 800.0 + speed * 32.0;
        let now = clock.system_ms();

        distributor.push_signal(
            DEMO_SPEED_SIGNAL,
            DEFAULT_FETCH_REQUEST_ID,
            now,
            SignalValue::Float64(speed),
        );
        distributor.push_signal(
            DEMO_RPM_SIGNAL,
            DEFAULT_FETCH_REQUEST_ID,
            now,
            SignalValue::Float64(rpm),
        );
        distributor.push_signal(
            DEMO_BRAKE_SIGNAL,
            DEFAULT_FETCH_REQUEST_ID,
            now,
            SignalValue::Bool(braking),
        );

        tick += 1;
        sleep(Duration::from_millis(100)).await;
    }
}
