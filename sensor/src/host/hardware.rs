use std::time::Instant;

use hopper_common::{sampler::SPEED_OF_SOUND_CM_PER_US, BatterySource, EchoPins};

const ECHO_RISE_DELAY_US: u64 = 450;

/// Stands in for the trigger/echo pair on a workstation: the echo pulse
/// appears after each trigger and is as wide as a real module would report
/// for the configured distance.
pub struct SimulatedEcho {
    origin: Instant,
    distance_cm: f32,
    trigger_high: bool,
    fired_at_us: Option<u64>,
    shots: u64,
}

impl SimulatedEcho {
    pub fn new(distance_cm: f32) -> Self {
        Self {
            origin: Instant::now(),
            distance_cm,
            trigger_high: false,
            fired_at_us: None,
            shots: 0,
        }
    }

    fn elapsed_us(&self) -> u64 {
        self.origin
            .elapsed()
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn pulse_us(&self) -> u64 {
        // Small wobble so consecutive readings are not identical.
        let distance = self.distance_cm + (self.shots % 5) as f32 * 0.2;
        (distance.max(0.0) * 2.0 / SPEED_OF_SOUND_CM_PER_US) as u64
    }
}

impl EchoPins for SimulatedEcho {
    fn set_trigger(&mut self, high: bool) {
        if self.trigger_high && !high {
            self.fired_at_us = Some(self.elapsed_us());
            self.shots = self.shots.wrapping_add(1);
        }
        self.trigger_high = high;
    }

    fn echo_is_high(&mut self) -> bool {
        let Some(fired_at) = self.fired_at_us else {
            return false;
        };
        let rise = fired_at + ECHO_RISE_DELAY_US;
        let now = self.elapsed_us();
        now >= rise && now < rise + self.pulse_us()
    }

    fn delay_us(&mut self, us: u32) {
        let until = self.elapsed_us() + u64::from(us);
        while self.elapsed_us() < until {
            std::hint::spin_loop();
        }
    }

    fn now_us(&mut self) -> u64 {
        self.elapsed_us()
    }
}

pub struct SimulatedBattery {
    raw: u16,
}

impl SimulatedBattery {
    pub fn new(raw: u16) -> Self {
        Self { raw }
    }
}

impl BatterySource for SimulatedBattery {
    fn read_raw(&mut self) -> u16 {
        self.raw
    }
}
