use embedded_hal::{digital::InputPin, i2c::I2c};
use ft6336::{Error as TouchError, Ft6336};
use murmur_core::touch::{TouchPanel, TouchPoint};

/// FT6336 panel plus its active-low interrupt line.
#[derive(Debug)]
pub struct TouchInput<I2C, INT> {
    driver: Ft6336<I2C>,
    int: INT,
}

impl<I2C, INT> TouchInput<I2C, INT>
where
    I2C: I2c,
    INT: InputPin,
{
    pub fn new(driver: Ft6336<I2C>, int: INT) -> Self {
        Self { driver, int }
    }

    pub fn driver_mut(&mut self) -> &mut Ft6336<I2C> {
        &mut self.driver
    }

    /// Reads the interrupt line; a pin error reads as released.
    pub fn line_low(&mut self) -> bool {
        self.int.is_low().unwrap_or(false)
    }
}

impl<I2C, INT> TouchPanel for TouchInput<I2C, INT>
where
    I2C: I2c,
    INT: InputPin,
{
    type Error = TouchError<I2C::Error>;

    fn int_asserted(&mut self) -> bool {
        self.line_low()
    }

    fn read_touch(&mut self) -> Result<Option<TouchPoint>, Self::Error> {
        Ok(self
            .driver
            .read_touch()?
            .map(|touch| TouchPoint {
                x: touch.x,
                y: touch.y,
            }))
    }
}
