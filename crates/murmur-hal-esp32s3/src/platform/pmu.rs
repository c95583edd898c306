//! AXP2101 power-management unit, raw register access.

use embedded_hal::i2c::I2c;

pub const AXP2101_ADDR: u8 = 0x34;

const REG_STATUS2: u8 = 0x01;
const REG_COMMON_CONFIG: u8 = 0x10;
const REG_ADC_ENABLE: u8 = 0x30;
const REG_VBAT_H: u8 = 0x34;
const REG_IRQ_STATUS0: u8 = 0x48;
const REG_LDO_ONOFF0: u8 = 0x90;
const REG_LDO_ONOFF1: u8 = 0x91;

const ADC_VBAT: u8 = 1 << 0;
const SOFT_POWER_OFF: u8 = 1 << 0;
const CHARGE_STATUS_MASK: u8 = 0b0110_0000;
const CHARGE_STATUS_CHARGING: u8 = 0b0010_0000;

const LDO_MIN_MV: u16 = 500;
const LDO_MAX_MV: u16 = 3_500;
const LDO_STEP_MV: u16 = 100;

/// Switchable LDO outputs wired on the watch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rail {
    /// Backlight supply.
    Aldo2,
    /// Display and touch controller.
    Aldo3,
    Aldo4,
    Bldo1,
    /// Haptic driver.
    Bldo2,
    /// Speaker amplifier.
    Dldo1,
}

impl Rail {
    const fn enable_bit(self) -> (u8, u8) {
        match self {
            Self::Aldo2 => (REG_LDO_ONOFF0, 1 << 1),
            Self::Aldo3 => (REG_LDO_ONOFF0, 1 << 2),
            Self::Aldo4 => (REG_LDO_ONOFF0, 1 << 3),
            Self::Bldo1 => (REG_LDO_ONOFF0, 1 << 4),
            Self::Bldo2 => (REG_LDO_ONOFF0, 1 << 5),
            Self::Dldo1 => (REG_LDO_ONOFF1, 1 << 0),
        }
    }

    const fn voltage_register(self) -> u8 {
        match self {
            Self::Aldo2 => 0x93,
            Self::Aldo3 => 0x94,
            Self::Aldo4 => 0x95,
            Self::Bldo1 => 0x96,
            Self::Bldo2 => 0x97,
            Self::Dldo1 => 0x99,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aldo2 => "aldo2",
            Self::Aldo3 => "aldo3",
            Self::Aldo4 => "aldo4",
            Self::Bldo1 => "bldo1",
            Self::Bldo2 => "bldo2",
            Self::Dldo1 => "dldo1",
        }
    }
}

/// Rails that are cut before deep sleep. The display/touch rail stays up so
/// the touch controller can still pull its interrupt line.
pub const SLEEP_CUT_RAILS: [Rail; 5] = [
    Rail::Aldo2,
    Rail::Aldo4,
    Rail::Bldo1,
    Rail::Bldo2,
    Rail::Dldo1,
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PmuError<E> {
    I2c(E),
    InvalidVoltage,
}

#[derive(Debug)]
pub struct Axp2101<I2C> {
    i2c: I2C,
}

impl<I2C> Axp2101<I2C>
where
    I2C: I2c,
{
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    pub fn set_rail_voltage(&mut self, rail: Rail, mv: u16) -> Result<(), PmuError<I2C::Error>> {
        if !(LDO_MIN_MV..=LDO_MAX_MV).contains(&mv) {
            return Err(PmuError::InvalidVoltage);
        }
        let code = ((mv - LDO_MIN_MV) / LDO_STEP_MV) as u8;
        self.write(rail.voltage_register(), code)
    }

    pub fn set_rail(&mut self, rail: Rail, on: bool) -> Result<(), PmuError<I2C::Error>> {
        let (register, bit) = rail.enable_bit();
        self.update(register, bit, if on { bit } else { 0 })
    }

    pub fn enable_battery_adc(&mut self, on: bool) -> Result<(), PmuError<I2C::Error>> {
        self.update(REG_ADC_ENABLE, ADC_VBAT, if on { ADC_VBAT } else { 0 })
    }

    /// Battery voltage from the 14-bit VBAT ADC, already in millivolts.
    pub fn battery_mv(&mut self) -> Result<u16, PmuError<I2C::Error>> {
        let mut raw = [0u8; 2];
        self.i2c
            .write_read(AXP2101_ADDR, &[REG_VBAT_H], &mut raw)
            .map_err(PmuError::I2c)?;
        Ok((u16::from(raw[0] & 0x3F) << 8) | u16::from(raw[1]))
    }

    pub fn is_charging(&mut self) -> Result<bool, PmuError<I2C::Error>> {
        let status = self.read(REG_STATUS2)?;
        Ok(status & CHARGE_STATUS_MASK == CHARGE_STATUS_CHARGING)
    }

    /// Acknowledges every latched interrupt so the INT line releases.
    pub fn clear_irqs(&mut self) -> Result<(), PmuError<I2C::Error>> {
        for offset in 0..3 {
            self.write(REG_IRQ_STATUS0 + offset, 0xFF)?;
        }
        Ok(())
    }

    /// Cuts every output. Nothing runs after this succeeds.
    pub fn power_off(&mut self) -> Result<(), PmuError<I2C::Error>> {
        self.update(REG_COMMON_CONFIG, SOFT_POWER_OFF, SOFT_POWER_OFF)
    }

    fn read(&mut self, register: u8) -> Result<u8, PmuError<I2C::Error>> {
        let mut value = [0u8; 1];
        self.i2c
            .write_read(AXP2101_ADDR, &[register], &mut value)
            .map_err(PmuError::I2c)?;
        Ok(value[0])
    }

    fn write(&mut self, register: u8, value: u8) -> Result<(), PmuError<I2C::Error>> {
        self.i2c
            .write(AXP2101_ADDR, &[register, value])
            .map_err(PmuError::I2c)
    }

    fn update(&mut self, register: u8, mask: u8, value: u8) -> Result<(), PmuError<I2C::Error>> {
        let current = self.read(register)?;
        self.write(register, (current & !mask) | (value & mask))
    }
}
