pub const MIN_BATTERY_VOLTAGE: f32 = 1.8;
pub const MAX_BATTERY_VOLTAGE: f32 = 4.5;

/// Raw sample source for the battery sense input.
pub trait BatterySource {
    fn read_raw(&mut self) -> u16;
}

impl<T: BatterySource + ?Sized> BatterySource for Box<T> {
    fn read_raw(&mut self) -> u16 {
        (**self).read_raw()
    }
}

/// Converts ADC counts into volts at the battery terminals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScale {
    pub full_scale_raw: u16,
    pub reference_volts: f32,
    pub divider_ratio: f32,
}

impl AdcScale {
    /// 16-bit normalized reading behind a 2:1 divider on a 3.3 V rail.
    pub const U16_HALF_DIVIDER: Self = Self {
        full_scale_raw: u16::MAX,
        reference_volts: 3.3,
        divider_ratio: 2.0,
    };

    /// 12-bit one-shot reading behind the same divider.
    pub const U12_HALF_DIVIDER: Self = Self {
        full_scale_raw: 4_095,
        reference_volts: 3.3,
        divider_ratio: 2.0,
    };

    pub fn volts(&self, raw: u16) -> f32 {
        f32::from(raw) * (self.reference_volts / f32::from(self.full_scale_raw)) * self.divider_ratio
    }
}

impl Default for AdcScale {
    fn default() -> Self {
        Self::U16_HALF_DIVIDER
    }
}

pub fn charge_percentage(voltage: f32) -> f32 {
    let pct = (voltage - MIN_BATTERY_VOLTAGE) / (MAX_BATTERY_VOLTAGE - MIN_BATTERY_VOLTAGE) * 100.0;
    if pct.is_nan() {
        return 0.0;
    }
    pct.clamp(0.0, 100.0)
}

pub struct BatteryMonitor<A> {
    source: A,
    scale: AdcScale,
}

impl<A: BatterySource> BatteryMonitor<A> {
    pub fn new(source: A, scale: AdcScale) -> Self {
        Self { source, scale }
    }

    pub fn read(&mut self) -> f32 {
        let raw = self.source.read_raw();
        charge_percentage(self.scale.volts(raw))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedBattery(pub(crate) u16);

    impl BatterySource for FixedBattery {
        fn read_raw(&mut self) -> u16 {
            self.0
        }
    }

    #[test]
    fn maps_voltage_window_linearly() {
        assert_eq!(charge_percentage(MIN_BATTERY_VOLTAGE), 0.0);
        assert_eq!(charge_percentage(MAX_BATTERY_VOLTAGE), 100.0);
        assert!((charge_percentage(3.15) - 50.0).abs() < 0.01);
    }

    #[test]
    fn clamps_outside_window() {
        assert_eq!(charge_percentage(0.4), 0.0);
        assert_eq!(charge_percentage(6.6), 100.0);
    }

    #[test]
    fn full_scale_reading_saturates() {
        let mut monitor = BatteryMonitor::new(FixedBattery(u16::MAX), AdcScale::default());
        assert_eq!(monitor.read(), 100.0);
    }

    #[test]
    fn half_scale_reading_reports_partial_charge() {
        // 32768 counts -> ~1.65 V at the pin -> ~3.3 V at the cell.
        let mut monitor = BatteryMonitor::new(FixedBattery(32_768), AdcScale::default());
        let pct = monitor.read();
        assert!((pct - 55.56).abs() < 0.1, "pct was {pct}");
    }

    #[test]
    fn twelve_bit_scale_reaches_same_voltage() {
        let volts = AdcScale::U12_HALF_DIVIDER.volts(2_048);
        assert!((volts - 3.3).abs() < 0.01, "volts was {volts}");
    }
}
