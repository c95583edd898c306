//! Touch debouncing and the wake-tap contract.
//!
//! While the device sleeps only the interrupt line is sampled. The touch that
//! wakes or undims the screen is consumed and never reaches the UI.

use core::fmt::Debug;

use log::debug;

use crate::power::PowerState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TouchPoint {
    pub x: u16,
    pub y: u16,
}

pub trait TouchPanel {
    type Error: Debug;

    /// Samples the interrupt line without bus traffic. Low means touched.
    fn int_asserted(&mut self) -> bool;
    fn read_touch(&mut self) -> Result<Option<TouchPoint>, Self::Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TouchConfig {
    pub debounce_ms: u64,
    pub tap_min_ms: u64,
    pub tap_max_ms: u64,
}

impl Default for TouchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 30,
            tap_min_ms: 10,
            tap_max_ms: 500,
        }
    }
}

/// Result of one poll.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TouchReport {
    /// The caller should mark user activity.
    pub activity: bool,
    /// A touch that reached the UI was released after this many ms.
    pub released_after_ms: Option<u64>,
}

impl TouchReport {
    /// Release qualifies as a tap on the home and recording screens.
    pub fn is_tap(&self, config: &TouchConfig) -> bool {
        self.released_after_ms
            .is_some_and(|held| held >= config.tap_min_ms && held < config.tap_max_ms)
    }

    /// Release qualifies as a dismiss on the answer screen.
    pub fn is_short_release(&self, config: &TouchConfig) -> bool {
        self.released_after_ms
            .is_some_and(|held| held < config.tap_max_ms)
    }
}

#[derive(Debug, Default)]
pub struct TouchTracker {
    config: TouchConfig,
    was_touched: bool,
    down_ms: u64,
    pending: bool,
    processed: bool,
    ignore_tap: bool,
}

impl TouchTracker {
    pub fn new(config: TouchConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &TouchConfig {
        &self.config
    }

    /// Swallows the rest of the current touch.
    pub fn consume(&mut self) {
        self.ignore_tap = true;
    }

    pub fn ignoring(&self) -> bool {
        self.ignore_tap
    }

    pub fn poll<P: TouchPanel>(
        &mut self,
        panel: &mut P,
        power: PowerState,
        now_ms: u64,
    ) -> TouchReport {
        let mut report = TouchReport::default();

        if matches!(power, PowerState::LightSleep | PowerState::DeepSleep) {
            if panel.int_asserted() {
                report.activity = true;
                self.ignore_tap = true;
            }
            return report;
        }

        let touched = match panel.read_touch() {
            Ok(point) => point.is_some(),
            Err(err) => {
                debug!("touch: read failed: {:?}", err);
                return report;
            }
        };

        if touched && !self.was_touched {
            self.down_ms = now_ms;
            self.pending = true;
            self.processed = false;
            if power == PowerState::Dimmed {
                report.activity = true;
                self.ignore_tap = true;
                self.processed = true;
            }
        }

        let released = !touched && self.was_touched;
        if released {
            self.pending = false;
        }
        self.was_touched = touched;

        if power == PowerState::Dimmed {
            return report;
        }

        let held_ms = now_ms.saturating_sub(self.down_ms);
        if self.pending && touched && held_ms >= self.config.debounce_ms && !self.processed {
            report.activity = true;
        }

        if self.ignore_tap {
            if !touched {
                self.ignore_tap = false;
            }
            return report;
        }

        if released && !self.processed {
            self.processed = true;
            report.released_after_ms = Some(held_ms);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedPanel {
        touched: bool,
        int_low: bool,
        reads: u32,
    }

    impl ScriptedPanel {
        fn new() -> Self {
            Self {
                touched: false,
                int_low: false,
                reads: 0,
            }
        }
    }

    impl TouchPanel for ScriptedPanel {
        type Error = ();

        fn int_asserted(&mut self) -> bool {
            self.int_low
        }

        fn read_touch(&mut self) -> Result<Option<TouchPoint>, Self::Error> {
            self.reads += 1;
            Ok(self.touched.then_some(TouchPoint { x: 120, y: 120 }))
        }
    }

    fn tap(
        tracker: &mut TouchTracker,
        panel: &mut ScriptedPanel,
        power: PowerState,
        down_ms: u64,
        up_ms: u64,
    ) -> (TouchReport, TouchReport) {
        panel.touched = true;
        let down = tracker.poll(panel, power, down_ms);
        panel.touched = false;
        let up = tracker.poll(panel, power, up_ms);
        (down, up)
    }

    #[test]
    fn short_touch_while_active_is_a_tap() {
        let mut tracker = TouchTracker::new(TouchConfig::default());
        let mut panel = ScriptedPanel::new();
        let (_, up) = tap(&mut tracker, &mut panel, PowerState::Active, 1_000, 1_120);

        assert_eq!(up.released_after_ms, Some(120));
        assert!(up.is_tap(tracker.config()));
    }

    #[test]
    fn held_touch_counts_as_activity_after_debounce() {
        let mut tracker = TouchTracker::new(TouchConfig::default());
        let mut panel = ScriptedPanel::new();
        panel.touched = true;

        assert!(!tracker.poll(&mut panel, PowerState::Active, 0).activity);
        assert!(!tracker.poll(&mut panel, PowerState::Active, 29).activity);
        assert!(tracker.poll(&mut panel, PowerState::Active, 30).activity);
    }

    #[test]
    fn too_short_or_too_long_is_not_a_tap() {
        let config = TouchConfig::default();
        let mut tracker = TouchTracker::new(config);
        let mut panel = ScriptedPanel::new();

        let (_, blip) = tap(&mut tracker, &mut panel, PowerState::Active, 0, 5);
        assert!(!blip.is_tap(&config));
        assert!(blip.is_short_release(&config));

        let (_, hold) = tap(&mut tracker, &mut panel, PowerState::Active, 1_000, 1_500);
        assert!(!hold.is_tap(&config));
        assert!(!hold.is_short_release(&config));
    }

    #[test]
    fn sleeping_samples_only_the_interrupt_line() {
        let mut tracker = TouchTracker::new(TouchConfig::default());
        let mut panel = ScriptedPanel::new();

        assert_eq!(
            tracker.poll(&mut panel, PowerState::LightSleep, 0),
            TouchReport::default()
        );
        panel.int_low = true;
        assert!(tracker.poll(&mut panel, PowerState::LightSleep, 10).activity);
        assert_eq!(panel.reads, 0);
        assert!(tracker.ignoring());
    }

    #[test]
    fn wake_touch_is_consumed() {
        let mut tracker = TouchTracker::new(TouchConfig::default());
        let mut panel = ScriptedPanel::new();
        panel.int_low = true;
        let _ = tracker.poll(&mut panel, PowerState::LightSleep, 0);

        // The finger is still down after the wake and lifts shortly after.
        let (_, up) = tap(&mut tracker, &mut panel, PowerState::Active, 50, 150);
        assert_eq!(up.released_after_ms, None);
        assert!(!tracker.ignoring());

        let (_, next) = tap(&mut tracker, &mut panel, PowerState::Active, 1_000, 1_100);
        assert_eq!(next.released_after_ms, Some(100));
    }

    #[test]
    fn undim_touch_is_consumed() {
        let mut tracker = TouchTracker::new(TouchConfig::default());
        let mut panel = ScriptedPanel::new();

        panel.touched = true;
        let down = tracker.poll(&mut panel, PowerState::Dimmed, 0);
        assert!(down.activity);

        panel.touched = false;
        let up = tracker.poll(&mut panel, PowerState::Active, 80);
        assert!(!up.activity);
        assert_eq!(up.released_after_ms, None);
    }
}
