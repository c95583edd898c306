use embedded_hal::{delay::DelayNs, i2c::I2c, pwm::SetDutyCycle};
use log::{debug, info, warn};
use murmur_core::power::{CpuCeiling, Halt, PowerBoard};

use super::pmu::{Axp2101, PmuError, Rail};

/// Supply voltage for every LDO the firmware switches.
const RAIL_MV: u16 = 3_300;

/// Power board backed by the AXP2101 and a PWM backlight.
#[derive(Debug)]
pub struct WatchBoard<I2C, BL, D> {
    pmu: Axp2101<I2C>,
    backlight: BL,
    delay: D,
    ceiling: Option<CpuCeiling>,
}

impl<I2C, BL, D> WatchBoard<I2C, BL, D>
where
    I2C: I2c,
    BL: SetDutyCycle,
    D: DelayNs,
{
    pub fn new(pmu: Axp2101<I2C>, backlight: BL, delay: D) -> Self {
        Self {
            pmu,
            backlight,
            delay,
            ceiling: None,
        }
    }

    /// Brings up the display, touch, and backlight rails and the battery ADC.
    /// Haptics and speaker stay off until something needs them.
    pub fn initialize(&mut self) -> Result<(), PmuError<I2C::Error>> {
        for rail in [Rail::Aldo2, Rail::Aldo3] {
            self.pmu.set_rail_voltage(rail, RAIL_MV)?;
            self.pmu.set_rail(rail, true)?;
        }
        for rail in [Rail::Bldo2, Rail::Dldo1] {
            self.pmu.set_rail(rail, false)?;
        }
        self.pmu.enable_battery_adc(true)?;
        self.pmu.clear_irqs()?;
        info!("board: rails up aldo2/aldo3 at {}mV", RAIL_MV);
        Ok(())
    }
}

impl<I2C, BL, D> PowerBoard for WatchBoard<I2C, BL, D>
where
    I2C: I2c,
    BL: SetDutyCycle,
    D: DelayNs,
{
    type Error = PmuError<I2C::Error>;

    fn set_cpu_ceiling(&mut self, ceiling: CpuCeiling) {
        // esp-hal fixes the CPU clock at init; the ceiling is tracked for logs.
        if self.ceiling != Some(ceiling) {
            debug!("board: cpu ceiling {}MHz", ceiling.mhz());
            self.ceiling = Some(ceiling);
        }
    }

    // No frequency scaling on this board, so there is nothing to hold.
    fn set_cpu_lock(&mut self, held: bool) {
        debug!("board: cpu lock held={}", held);
    }

    fn set_display_power(&mut self, on: bool) -> Result<(), Self::Error> {
        if !on {
            let _ = self.backlight.set_duty_cycle_fully_off();
        }
        self.pmu.set_rail(Rail::Aldo2, on)
    }

    fn set_backlight(&mut self, level: u8) {
        if self
            .backlight
            .set_duty_cycle_fraction(u16::from(level), u16::from(u8::MAX))
            .is_err()
        {
            warn!("board: backlight duty update failed level={}", level);
        }
    }

    fn battery_voltage_mv(&mut self) -> Result<u16, Self::Error> {
        self.pmu.battery_mv()
    }

    fn is_charging(&mut self) -> Result<bool, Self::Error> {
        self.pmu.is_charging()
    }

    fn show_low_battery_warning(&mut self, hold_ms: u32) {
        warn!("board: battery critical; powering off in {}ms", hold_ms);
        let _ = self.backlight.set_duty_cycle_fully_on();
        self.delay.delay_ms(hold_ms);
    }

    fn power_off(&mut self) -> Halt {
        if let Err(err) = self.pmu.power_off() {
            warn!("board: pmu power-off failed: {:?}", err);
        }
        Halt::Shutdown
    }
}
