use embedded_hal::i2c::I2c;
use ft6336::Ft6336;
use log::{info, warn};
use murmur_core::power::{ArmError, Halt, ShutdownSequence};
use murmur_hal_esp32s3::{
    network::request_teardown,
    platform::{
        pmu::{Axp2101, Rail, SLEEP_CUT_RAILS},
        sleep::arm_and_sleep,
    },
};

use super::{LINK_STATUS, RADIO_COMMANDS};

/// Deep-sleep and restart steps over the PMU and the touch controller.
///
/// Both drivers sit on shared bus handles; the power board and the touch
/// panel own the other halves.
pub(super) struct WatchShutdown<PMU, TOUCH> {
    pmu: Axp2101<PMU>,
    touch: Ft6336<TOUCH>,
}

impl<PMU, TOUCH> WatchShutdown<PMU, TOUCH>
where
    PMU: I2c,
    TOUCH: I2c,
{
    pub(super) fn new(pmu: Axp2101<PMU>, touch: Ft6336<TOUCH>) -> Self {
        Self { pmu, touch }
    }

    /// Puts the chip straight back to sleep after a wake that did not
    /// validate. Rails are already in their sleep state.
    pub(super) fn rearm_and_sleep(&mut self) -> ! {
        if self.arm_wake_sources().is_err() {
            warn!("power: pmu irq clear failed on rearm; restarting");
            esp_hal::system::software_reset();
        }
        arm_and_sleep()
    }
}

impl<PMU, TOUCH> ShutdownSequence for WatchShutdown<PMU, TOUCH>
where
    PMU: I2c,
    TOUCH: I2c,
{
    fn sleep_display(&mut self) {
        if let Err(err) = self.pmu.set_rail(Rail::Aldo2, false) {
            warn!("power: display rail off failed: {:?}", err);
        }
    }

    // The host task finishes the teardown; the main loop waits on
    // `RADIO_DOWN` before cutting rails.
    fn teardown_radio(&mut self) {
        request_teardown(&RADIO_COMMANDS, &LINK_STATUS);
    }

    fn cut_rails(&mut self) {
        for rail in SLEEP_CUT_RAILS {
            if let Err(err) = self.pmu.set_rail(rail, false) {
                warn!("power: rail {} off failed: {:?}", rail.as_str(), err);
            }
        }
        if let Err(err) = self.pmu.enable_battery_adc(false) {
            warn!("power: battery adc off failed: {:?}", err);
        }
    }

    fn touch_monitor_mode(&mut self) {
        if let Err(err) = self.touch.enter_monitor_mode() {
            warn!("power: touch monitor mode failed: {:?}", err);
        }
        let _ = self.touch.clear_interrupt();
    }

    fn arm_wake_sources(&mut self) -> Result<(), ArmError> {
        // A latched PMU interrupt holds ext1 low and wakes the chip at once.
        self.pmu.clear_irqs().map_err(|err| {
            warn!("power: pmu irq clear failed: {:?}", err);
            ArmError
        })
    }

    fn sleep(&mut self) -> Halt {
        info!("power: entering deep sleep");
        arm_and_sleep()
    }

    fn restart(&mut self) -> Halt {
        info!("power: restarting");
        esp_hal::system::software_reset()
    }
}
