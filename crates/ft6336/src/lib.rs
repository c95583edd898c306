#![cfg_attr(not(test), no_std)]

//! FT6336 capacitive touch controller driver primitives.

use embedded_hal::i2c::I2c;

/// Fixed 7-bit bus address.
pub const ADDRESS: u8 = 0x38;

/// Register map subset used by the driver.
pub mod reg {
    /// Start of the touch report block (`DEV_MODE` .. `P1_YL`).
    pub const REPORT: u8 = 0x00;
    pub const TD_STATUS: u8 = 0x02;
    pub const PERIOD_MONITOR: u8 = 0x87;
    pub const CHIP_ID: u8 = 0xA3;
    pub const G_MODE: u8 = 0xA4;
    pub const POWER_MODE: u8 = 0xA5;
}

/// Bytes in the touch report block starting at [`reg::REPORT`].
pub const REPORT_LEN: usize = 7;

/// How the INT line behaves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum InterruptMode {
    /// INT stays low while a finger is down.
    Polling = 0x00,
    /// INT pulses once per report.
    Trigger = 0x01,
}

/// Controller scan mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PowerMode {
    Active = 0x00,
    /// Slow scan that still raises INT on touch.
    Monitor = 0x01,
    /// No scanning; only a reset brings it back.
    Hibernate = 0x03,
}

/// Touch event flag from `P1_XH[7:6]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TouchEvent {
    PressDown,
    LiftUp,
    Contact,
    NoEvent,
}

impl TouchEvent {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::PressDown,
            1 => Self::LiftUp,
            2 => Self::Contact,
            _ => Self::NoEvent,
        }
    }
}

/// First touch point of a report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Touch {
    pub x: u16,
    pub y: u16,
    pub event: TouchEvent,
    /// Number of fingers the controller reports (1 or 2).
    pub points: u8,
}

/// Driver configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// Bus address, [`ADDRESS`] on every known board.
    pub address: u8,
    /// Monitor-mode scan period in controller units (roughly ms / 10).
    pub monitor_period: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ADDRESS,
            monitor_period: 0x28,
        }
    }
}

/// Driver errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error<E> {
    /// Bus transaction failed.
    I2c(E),
    /// Input parameters are outside supported bounds.
    InvalidInput,
}

/// Decodes a raw report block. Returns `None` when no finger is down.
pub fn decode_report(raw: &[u8; REPORT_LEN]) -> Option<Touch> {
    let points = raw[2] & 0x0F;
    if points == 0 || points > 2 {
        return None;
    }

    let event = TouchEvent::from_bits(raw[3] >> 6);
    if matches!(event, TouchEvent::LiftUp | TouchEvent::NoEvent) {
        return None;
    }

    let x = (u16::from(raw[3] & 0x0F) << 8) | u16::from(raw[4]);
    let y = (u16::from(raw[5] & 0x0F) << 8) | u16::from(raw[6]);
    Some(Touch {
        x,
        y,
        event,
        points,
    })
}

/// FT6336 driver.
#[derive(Debug)]
pub struct Ft6336<I2C> {
    i2c: I2C,
    config: Config,
}

impl<I2C> Ft6336<I2C>
where
    I2C: I2c,
{
    /// Creates a new driver instance.
    pub fn new(i2c: I2C, config: Config) -> Self {
        Self { i2c, config }
    }

    /// Returns current configuration.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Releases the owned bus.
    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Reads the vendor chip id.
    pub fn chip_id(&mut self) -> Result<u8, Error<I2C::Error>> {
        self.read_register(reg::CHIP_ID)
    }

    /// Selects how the INT line signals touches.
    pub fn set_interrupt_mode(&mut self, mode: InterruptMode) -> Result<(), Error<I2C::Error>> {
        self.write_register(reg::G_MODE, mode as u8)
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), Error<I2C::Error>> {
        self.write_register(reg::POWER_MODE, mode as u8)
    }

    /// Sets the monitor scan period. Zero is rejected.
    pub fn set_monitor_period(&mut self, period: u8) -> Result<(), Error<I2C::Error>> {
        if period == 0 {
            return Err(Error::InvalidInput);
        }
        self.write_register(reg::PERIOD_MONITOR, period)
    }

    /// Programs the configured monitor period and switches to monitor mode,
    /// leaving INT armed for a wake touch.
    pub fn enter_monitor_mode(&mut self) -> Result<(), Error<I2C::Error>> {
        self.set_interrupt_mode(InterruptMode::Polling)?;
        self.set_monitor_period(self.config.monitor_period)?;
        self.set_power_mode(PowerMode::Monitor)
    }

    /// Reads the status register, which releases a latched INT.
    pub fn clear_interrupt(&mut self) -> Result<(), Error<I2C::Error>> {
        self.read_register(reg::TD_STATUS).map(|_| ())
    }

    /// Reads the first touch point, if any.
    pub fn read_touch(&mut self) -> Result<Option<Touch>, Error<I2C::Error>> {
        let mut raw = [0u8; REPORT_LEN];
        self.i2c
            .write_read(self.config.address, &[reg::REPORT], &mut raw)
            .map_err(Error::I2c)?;
        Ok(decode_report(&raw))
    }

    fn read_register(&mut self, register: u8) -> Result<u8, Error<I2C::Error>> {
        let mut value = [0u8; 1];
        self.i2c
            .write_read(self.config.address, &[register], &mut value)
            .map_err(Error::I2c)?;
        Ok(value[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Error<I2C::Error>> {
        self.i2c
            .write(self.config.address, &[register, value])
            .map_err(Error::I2c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::i2c::{ErrorType, Operation};

    struct FakeBus {
        regs: [u8; 256],
        writes: Vec<(u8, u8)>,
        reads: Vec<u8>,
        pointer: u8,
    }

    impl FakeBus {
        fn new() -> Self {
            Self {
                regs: [0; 256],
                writes: Vec::new(),
                reads: Vec::new(),
                pointer: 0,
            }
        }
    }

    impl ErrorType for FakeBus {
        type Error = Infallible;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            assert_eq!(address, ADDRESS);
            for op in operations.iter_mut() {
                match op {
                    Operation::Write(bytes) => {
                        self.pointer = bytes[0];
                        if let Some(value) = bytes.get(1) {
                            self.regs[self.pointer as usize] = *value;
                            self.writes.push((self.pointer, *value));
                        }
                    }
                    Operation::Read(out) => {
                        self.reads.push(self.pointer);
                        for (i, slot) in out.iter_mut().enumerate() {
                            *slot = self.regs[self.pointer as usize + i];
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn decodes_a_single_press() {
        let raw = [0x00, 0x00, 0x01, 0x01, 0x2C, 0x10, 0xF0];
        assert_eq!(
            decode_report(&raw),
            Some(Touch {
                x: 0x12C,
                y: 0x0F0,
                event: TouchEvent::PressDown,
                points: 1,
            })
        );
    }

    #[test]
    fn empty_or_lifted_reports_are_no_touch() {
        assert_eq!(decode_report(&[0; REPORT_LEN]), None);
        assert_eq!(decode_report(&[0, 0, 0x01, 0x40, 0x10, 0x00, 0x10]), None);
        assert_eq!(decode_report(&[0, 0, 0x0F, 0x80, 0x10, 0x00, 0x10]), None);
    }

    #[test]
    fn monitor_mode_programs_period_then_power_mode() {
        let mut touch = Ft6336::new(FakeBus::new(), Config::default());
        touch.enter_monitor_mode().unwrap();

        let bus = touch.release();
        assert_eq!(
            bus.writes,
            vec![
                (reg::G_MODE, InterruptMode::Polling as u8),
                (reg::PERIOD_MONITOR, 0x28),
                (reg::POWER_MODE, PowerMode::Monitor as u8),
            ]
        );
    }

    #[test]
    fn zero_monitor_period_is_rejected() {
        let mut touch = Ft6336::new(FakeBus::new(), Config::default());
        assert_eq!(touch.set_monitor_period(0), Err(Error::InvalidInput));
    }

    #[test]
    fn read_touch_pulls_the_report_block() {
        let mut bus = FakeBus::new();
        bus.regs[..REPORT_LEN].copy_from_slice(&[0, 0, 0x01, 0x80, 0x64, 0x00, 0x78]);
        let mut touch = Ft6336::new(bus, Config::default());

        let point = touch.read_touch().unwrap().unwrap();
        assert_eq!((point.x, point.y), (100, 120));
        assert_eq!(point.event, TouchEvent::Contact);

        touch.clear_interrupt().unwrap();
        assert_eq!(touch.release().reads, vec![reg::REPORT, reg::TD_STATUS]);
    }
}
