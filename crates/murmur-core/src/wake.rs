//! Boot-time check that a deep-sleep wake was caused by a real touch or the
//! secondary interrupt line.

use log::{debug, info};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetKind {
    PowerOn,
    DeepSleepWake,
    Other,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeSource {
    /// Touch controller interrupt, active low.
    Touch,
    /// PMU button or charger interrupt, active low.
    Secondary,
    Other,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpuriousWake {
    UnarmedSource,
    TouchNotHeld,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeVerdict {
    ColdBoot,
    Proceed(WakeSource),
    /// Re-arm and go back to deep sleep without finishing boot.
    BackToSleep(SpuriousWake),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WakeConfig {
    pub clear_attempts: u8,
    pub clear_settle_ms: u32,
    /// One touch-controller monitor scan period.
    pub recheck_delay_ms: u32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            clear_attempts: 5,
            clear_settle_ms: 15,
            recheck_delay_ms: 300,
        }
    }
}

/// Hardware queries needed before anything else is initialized.
pub trait WakeProbe {
    fn reset_kind(&self) -> ResetKind;
    fn wake_source(&self) -> WakeSource;
    /// Hands the wake pins back from the low-power IO domain.
    fn restore_wake_pins(&mut self);
    /// One attempt at clearing the latched touch interrupt over the bus.
    fn clear_touch_interrupt(&mut self) -> bool;
    fn delay_ms(&mut self, ms: u32);
    fn touch_line_low(&mut self) -> bool;
}

pub fn validate_wake<P: WakeProbe>(probe: &mut P, config: &WakeConfig) -> WakeVerdict {
    if probe.reset_kind() != ResetKind::DeepSleepWake {
        return WakeVerdict::ColdBoot;
    }

    probe.restore_wake_pins();

    match probe.wake_source() {
        WakeSource::Secondary => WakeVerdict::Proceed(WakeSource::Secondary),
        WakeSource::Other => {
            info!("wake: unarmed wake source; back to sleep");
            WakeVerdict::BackToSleep(SpuriousWake::UnarmedSource)
        }
        WakeSource::Touch => {
            let mut cleared = false;
            for attempt in 0..config.clear_attempts {
                if probe.clear_touch_interrupt() {
                    cleared = true;
                    break;
                }
                debug!("wake: touch interrupt clear attempt {} failed", attempt + 1);
                probe.delay_ms(config.clear_settle_ms);
            }
            if !cleared {
                debug!("wake: touch interrupt not cleared; rechecking anyway");
            }

            probe.delay_ms(config.recheck_delay_ms);
            if probe.touch_line_low() {
                WakeVerdict::Proceed(WakeSource::Touch)
            } else {
                info!("wake: touch line released after recheck; spurious wake");
                WakeVerdict::BackToSleep(SpuriousWake::TouchNotHeld)
            }
        }
    }
}
