//! Deep-sleep wake arming and the boot-time wake probe.
//!
//! The touch interrupt (GPIO16) wakes through EXT0 and the PMU interrupt
//! (GPIO21) through EXT1, both active low.

use embedded_hal::{delay::DelayNs, digital::InputPin, i2c::I2c};
use esp_hal::{
    gpio::RtcPin,
    peripherals::{GPIO16, GPIO21, LPWR},
    rtc_cntl::{
        Rtc, SocResetReason, reset_reason,
        sleep::{Ext0WakeupSource, Ext1WakeupSource, WakeupLevel},
        wakeup_cause,
    },
    system::{Cpu, SleepSource},
};
use log::info;
use murmur_core::wake::{ResetKind, WakeProbe, WakeSource};

use crate::input::touch::TouchInput;

pub const TOUCH_INT_GPIO: u8 = 16;
pub const PMU_INT_GPIO: u8 = 21;

pub fn boot_reset_kind() -> ResetKind {
    match reset_reason(Cpu::ProCpu) {
        Some(SocResetReason::CoreDeepSleep) => ResetKind::DeepSleepWake,
        Some(SocResetReason::ChipPowerOn) => ResetKind::PowerOn,
        _ => ResetKind::Other,
    }
}

pub fn boot_wake_source() -> WakeSource {
    match wakeup_cause() {
        SleepSource::Ext0 => WakeSource::Touch,
        SleepSource::Ext1 => WakeSource::Secondary,
        _ => WakeSource::Other,
    }
}

/// Releases the pad holds left on both wake lines so they read as ordinary
/// digital inputs again.
pub fn restore_wake_pins() {
    let touch_int = unsafe { GPIO16::steal() };
    let pmu_int = unsafe { GPIO21::steal() };
    touch_int.rtcio_pad_hold(false);
    pmu_int.rtcio_pad_hold(false);
}

/// Arms both wake lines and enters deep sleep. Never returns; the chip
/// resets on wake.
pub fn arm_and_sleep() -> ! {
    info!(
        "sleep: arming ext0=gpio{} ext1=gpio{} level=low",
        TOUCH_INT_GPIO, PMU_INT_GPIO
    );
    let mut rtc = Rtc::new(unsafe { LPWR::steal() });
    let touch_int = unsafe { GPIO16::steal() };
    let mut pmu_int = unsafe { GPIO21::steal() };

    let ext0 = Ext0WakeupSource::new(touch_int, WakeupLevel::Low);
    let mut secondary: [&mut dyn RtcPin; 1] = [&mut pmu_int];
    let ext1 = Ext1WakeupSource::new(&mut secondary, WakeupLevel::Low);

    rtc.sleep_deep(&[&ext0, &ext1]);
}

/// [`WakeProbe`] over the live chip state and the touch controller.
pub struct RtcWakeProbe<'a, I2C, INT, D> {
    touch: &'a mut TouchInput<I2C, INT>,
    delay: D,
    reset: ResetKind,
    source: WakeSource,
}

impl<'a, I2C, INT, D> RtcWakeProbe<'a, I2C, INT, D>
where
    I2C: I2c,
    INT: InputPin,
    D: DelayNs,
{
    pub fn new(touch: &'a mut TouchInput<I2C, INT>, delay: D) -> Self {
        Self {
            touch,
            delay,
            reset: boot_reset_kind(),
            source: boot_wake_source(),
        }
    }
}

impl<I2C, INT, D> WakeProbe for RtcWakeProbe<'_, I2C, INT, D>
where
    I2C: I2c,
    INT: InputPin,
    D: DelayNs,
{
    fn reset_kind(&self) -> ResetKind {
        self.reset
    }

    fn wake_source(&self) -> WakeSource {
        self.source
    }

    fn restore_wake_pins(&mut self) {
        restore_wake_pins();
    }

    fn clear_touch_interrupt(&mut self) -> bool {
        self.touch.driver_mut().clear_interrupt().is_ok()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    fn touch_line_low(&mut self) -> bool {
        self.touch.line_low()
    }
}
