use crate::error::{EchoEdge, SensorError};

pub const SPEED_OF_SOUND_CM_PER_US: f32 = 0.0343;
pub const ECHO_TIMEOUT_US: u64 = 30_000;

const TRIGGER_SETTLE_US: u32 = 2;
const TRIGGER_PULSE_US: u32 = 5;

/// Trigger/echo pin pair of an HC-SR04 style ranging module plus the
/// microsecond timebase used to time the echo pulse.
pub trait EchoPins {
    fn set_trigger(&mut self, high: bool);
    fn echo_is_high(&mut self) -> bool;
    fn delay_us(&mut self, us: u32);
    fn now_us(&mut self) -> u64;
}

impl<T: EchoPins + ?Sized> EchoPins for Box<T> {
    fn set_trigger(&mut self, high: bool) {
        (**self).set_trigger(high);
    }

    fn echo_is_high(&mut self) -> bool {
        (**self).echo_is_high()
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us);
    }

    fn now_us(&mut self) -> u64 {
        (**self).now_us()
    }
}

pub struct DistanceSampler<P> {
    pins: P,
    timeout_us: u64,
}

impl<P: EchoPins> DistanceSampler<P> {
    pub fn new(pins: P) -> Self {
        Self {
            pins,
            timeout_us: ECHO_TIMEOUT_US,
        }
    }

    #[cfg(test)]
    pub(crate) fn pins(&self) -> &P {
        &self.pins
    }

    #[cfg(test)]
    pub(crate) fn with_timeout_us(mut self, timeout_us: u64) -> Self {
        self.timeout_us = timeout_us;
        self
    }

    /// Fires one trigger pulse and returns the measured distance in cm.
    ///
    /// Each echo edge is awaited for at most the configured timeout; a
    /// disconnected or silent sensor yields [`SensorError::EchoTimeout`]
    /// instead of stalling the caller.
    pub fn measure(&mut self) -> Result<f32, SensorError> {
        self.pins.set_trigger(false);
        self.pins.delay_us(TRIGGER_SETTLE_US);
        self.pins.set_trigger(true);
        self.pins.delay_us(TRIGGER_PULSE_US);
        self.pins.set_trigger(false);

        let start = self.wait_for(true, EchoEdge::Rising)?;
        let end = self.wait_for(false, EchoEdge::Falling)?;

        let elapsed_us = end.saturating_sub(start) as f32;
        Ok(elapsed_us * SPEED_OF_SOUND_CM_PER_US / 2.0)
    }

    fn wait_for(&mut self, level: bool, edge: EchoEdge) -> Result<u64, SensorError> {
        let deadline = self.pins.now_us().saturating_add(self.timeout_us);
        loop {
            if self.pins.echo_is_high() == level {
                return Ok(self.pins.now_us());
            }
            if self.pins.now_us() >= deadline {
                return Err(SensorError::EchoTimeout {
                    edge,
                    timeout_us: self.timeout_us,
                });
            }
        }
    }
}
