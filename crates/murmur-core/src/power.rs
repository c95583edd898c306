//! Power state machine: CPU ceiling, display power, and sleep depth.
//!
//! The machine owns the board handle and is the only writer of
//! [`PowerState`]. Other components learn about transitions through a
//! [`DeviceLifecycleObserver`] passed into each call.

use core::fmt::Debug;

use log::{debug, info, warn};

use crate::audio::AudioCapture;

/// Current sleep depth of the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    Active,
    Dimmed,
    LightSleep,
    /// Terminal: the process restarts on wake, so nothing observes it live.
    DeepSleep,
}

impl PowerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dimmed => "dimmed",
            Self::LightSleep => "light_sleep",
            Self::DeepSleep => "deep_sleep",
        }
    }
}

/// Outcome that ends the current process instance.
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Halt {
    DeepSleep,
    Shutdown,
    Restart,
}

/// CPU frequency ceiling requested from the board.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuCeiling {
    Max,
    Reduced,
}

impl CpuCeiling {
    pub const fn mhz(self) -> u16 {
        match self {
            Self::Max => 160,
            Self::Reduced => 80,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerConfig {
    pub dim_timeout_ms: u64,
    pub light_sleep_timeout_ms: u64,
    /// Measured from light-sleep entry, not from the last activity.
    pub deep_sleep_timeout_ms: u64,
    pub battery_check_interval_ms: u64,
    pub charge_poll_interval_ms: u64,
    pub critical_battery_mv: u16,
    pub low_battery_mv: u16,
    pub low_battery_warning_ms: u32,
    pub backlight_active: u8,
    pub backlight_dim: u8,
    pub backlight_charging: u8,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            dim_timeout_ms: 10_000,
            light_sleep_timeout_ms: 20_000,
            deep_sleep_timeout_ms: 280_000,
            battery_check_interval_ms: 10_000,
            charge_poll_interval_ms: 5_000,
            critical_battery_mv: 2_700,
            low_battery_mv: 3_000,
            low_battery_warning_ms: 2_000,
            backlight_active: 70,
            backlight_dim: 12,
            backlight_charging: 50,
        }
    }
}

impl PowerConfig {
    pub const fn with_dim_timeout_ms(mut self, value: u64) -> Self {
        self.dim_timeout_ms = value;
        self
    }

    pub const fn with_light_sleep_timeout_ms(mut self, value: u64) -> Self {
        self.light_sleep_timeout_ms = value;
        self
    }

    pub const fn with_deep_sleep_timeout_ms(mut self, value: u64) -> Self {
        self.deep_sleep_timeout_ms = value;
        self
    }

    pub const fn with_critical_battery_mv(mut self, value: u16) -> Self {
        self.critical_battery_mv = value;
        self
    }
}

/// Board-level power controls the state machine drives.
pub trait PowerBoard {
    type Error: Debug;

    /// Caps the CPU clock. Boards with a fixed clock only record it.
    fn set_cpu_ceiling(&mut self, ceiling: CpuCeiling);
    /// Holds the CPU at full speed while recording. A no-op on boards
    /// without frequency scaling.
    fn set_cpu_lock(&mut self, held: bool);
    fn set_display_power(&mut self, on: bool) -> Result<(), Self::Error>;
    fn set_backlight(&mut self, level: u8);
    fn battery_voltage_mv(&mut self) -> Result<u16, Self::Error>;
    fn is_charging(&mut self) -> Result<bool, Self::Error>;
    /// Shows the low-battery notice and keeps it up for `hold_ms`.
    fn show_low_battery_warning(&mut self, hold_ms: u32);
    fn power_off(&mut self) -> Halt;
}

/// Receives power transitions. UI and link layers implement this; the state
/// machine never draws or transmits on its own.
pub trait DeviceLifecycleObserver {
    fn on_enter_state(&mut self, state: PowerState, now_ms: u64);
    fn on_wake(&mut self, now_ms: u64);
}

impl DeviceLifecycleObserver for () {
    fn on_enter_state(&mut self, _state: PowerState, _now_ms: u64) {}
    fn on_wake(&mut self, _now_ms: u64) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArmError;

/// Ordered steps of the deep-sleep preparation.
///
/// [`enter_deep_sleep`] calls them in declaration order; implementations must
/// not reorder work between steps.
pub trait ShutdownSequence {
    fn sleep_display(&mut self);
    fn teardown_radio(&mut self);
    fn cut_rails(&mut self);
    /// Leaves the touch controller scanning at a low rate so it can still
    /// assert its interrupt line.
    fn touch_monitor_mode(&mut self);
    fn arm_wake_sources(&mut self) -> Result<(), ArmError>;
    fn sleep(&mut self) -> Halt;
    fn restart(&mut self) -> Halt;
}

/// Runs the full deep-sleep preparation. Not cancellable once started.
///
/// Hosts whose radio tears down on another task call [`begin_deep_sleep`],
/// wait for the radio, then [`finish_deep_sleep`].
pub fn enter_deep_sleep<A, S>(audio: &mut A, seq: &mut S) -> Halt
where
    A: AudioCapture,
    S: ShutdownSequence,
{
    begin_deep_sleep(audio, seq);
    finish_deep_sleep(seq)
}

/// Releases the microphone, sleeps the display and requests the radio
/// teardown.
pub fn begin_deep_sleep<A, S>(audio: &mut A, seq: &mut S)
where
    A: AudioCapture,
    S: ShutdownSequence,
{
    info!("power: deep sleep preparation begin");
    audio.stop();
    audio.release();
    seq.sleep_display();
    seq.teardown_radio();
}

/// Cuts rails, arms wake sources and sleeps. Restarts if arming fails.
pub fn finish_deep_sleep<S: ShutdownSequence>(seq: &mut S) -> Halt {
    seq.cut_rails();
    seq.touch_monitor_mode();
    match seq.arm_wake_sources() {
        Ok(()) => seq.sleep(),
        Err(ArmError) => {
            warn!("power: wake source arming failed; restarting instead");
            seq.restart()
        }
    }
}

/// Last-activity and sleep-entry timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActivityClock {
    last_activity_ms: u64,
    sleep_entered_ms: u64,
}

impl ActivityClock {
    pub const fn new(now_ms: u64) -> Self {
        Self {
            last_activity_ms: now_ms,
            sleep_entered_ms: now_ms,
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub fn enter_sleep(&mut self, now_ms: u64) {
        self.sleep_entered_ms = now_ms;
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }

    pub fn asleep_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.sleep_entered_ms)
    }
}

/// Binary CPU performance lock with a single holder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CpuLock {
    held: bool,
}

impl CpuLock {
    /// Returns true when the lock changed hands.
    pub fn acquire(&mut self) -> bool {
        let changed = !self.held;
        self.held = true;
        changed
    }

    pub fn release(&mut self) -> bool {
        let changed = self.held;
        self.held = false;
        changed
    }

    pub const fn is_held(&self) -> bool {
        self.held
    }

    pub const fn holders(&self) -> u8 {
        self.held as u8
    }
}

/// What the scheduler has to do after [`PowerStateMachine::update`].
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerStep {
    Continue,
    /// Run [`enter_deep_sleep`]; the machine is already in `DeepSleep`.
    DeepSleepDue,
    Halted(Halt),
}

pub struct PowerStateMachine<B: PowerBoard> {
    board: B,
    config: PowerConfig,
    state: PowerState,
    clock: ActivityClock,
    cpu_lock: CpuLock,
    ceiling: CpuCeiling,
    wake_pending: bool,
    recording: bool,
    charging: bool,
    last_battery_check_ms: Option<u64>,
    last_charge_poll_ms: Option<u64>,
    battery_mv: Option<u16>,
}

impl<B: PowerBoard> PowerStateMachine<B> {
    pub fn new(board: B, config: PowerConfig, now_ms: u64) -> Self {
        let mut machine = Self {
            board,
            config,
            state: PowerState::Active,
            clock: ActivityClock::new(now_ms),
            cpu_lock: CpuLock::default(),
            ceiling: CpuCeiling::Max,
            wake_pending: false,
            recording: false,
            charging: false,
            last_battery_check_ms: None,
            last_charge_poll_ms: None,
            battery_mv: None,
        };
        machine.board.set_cpu_ceiling(CpuCeiling::Max);
        let level = machine.backlight_for(PowerState::Active);
        machine.board.set_backlight(level);
        machine
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PowerState::Active
    }

    pub fn is_dimmed(&self) -> bool {
        self.state == PowerState::Dimmed
    }

    pub fn is_light_sleep(&self) -> bool {
        self.state == PowerState::LightSleep
    }

    /// Screen is on and the CPU is not parked.
    pub fn can_do_work(&self) -> bool {
        matches!(self.state, PowerState::Active | PowerState::Dimmed)
    }

    pub fn is_charging(&self) -> bool {
        self.charging
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn wake_pending(&self) -> bool {
        self.wake_pending
    }

    pub fn cpu_lock(&self) -> CpuLock {
        self.cpu_lock
    }

    pub fn ceiling(&self) -> CpuCeiling {
        self.ceiling
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        self.clock.idle_ms(now_ms)
    }

    pub fn battery_mv(&self) -> Option<u16> {
        self.battery_mv
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    /// Resets the idle clock. In light sleep this only raises the wake flag;
    /// [`Self::service_wake`] does the actual resume.
    pub fn mark_activity<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        self.clock.touch(now_ms);
        match self.state {
            PowerState::LightSleep => {
                if !self.wake_pending {
                    debug!("power: wake requested");
                }
                self.wake_pending = true;
            }
            PowerState::Dimmed => self.enter_active(now_ms, observer),
            PowerState::Active | PowerState::DeepSleep => {}
        }
    }

    /// Services the wake flag. Returns true when a wake ran; the caller must
    /// skip the rest of its iteration in that case.
    pub fn service_wake<O: DeviceLifecycleObserver>(
        &mut self,
        now_ms: u64,
        observer: &mut O,
    ) -> bool {
        if !self.wake_pending {
            return false;
        }
        self.wake_pending = false;

        self.set_ceiling(CpuCeiling::Max);
        self.acquire_lock();
        if let Err(err) = self.board.set_display_power(true) {
            warn!("power: display power on failed: {:?}", err);
        }
        let level = self.backlight_for(PowerState::Active);
        self.board.set_backlight(level);
        self.state = PowerState::Active;
        self.clock.touch(now_ms);

        observer.on_wake(now_ms);
        observer.on_enter_state(PowerState::Active, now_ms);

        if !self.recording {
            self.release_lock();
        }
        info!("power: woke from light sleep");
        true
    }

    pub fn set_recording(&mut self, recording: bool, now_ms: u64) {
        if self.recording == recording {
            return;
        }
        self.recording = recording;
        self.clock.touch(now_ms);
        debug!("power: recording={}", recording);
    }

    /// Applies a charger state change. A toggle counts as activity but never
    /// raises the wake flag.
    pub fn set_charging<O: DeviceLifecycleObserver>(
        &mut self,
        charging: bool,
        now_ms: u64,
        observer: &mut O,
    ) {
        if self.charging == charging {
            return;
        }
        self.charging = charging;
        self.clock.touch(now_ms);
        info!("power: charging={}", charging);

        match self.state {
            PowerState::LightSleep if charging => {
                if let Err(err) = self.board.set_display_power(true) {
                    warn!("power: display power on failed: {:?}", err);
                }
                self.enter_dimmed(now_ms, observer);
            }
            PowerState::Active | PowerState::Dimmed => {
                let level = self.backlight_for(self.state);
                self.board.set_backlight(level);
            }
            _ => {}
        }
    }

    /// Moves toward `Active`; from light sleep this goes through the wake flag.
    pub fn force_active<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        self.mark_activity(now_ms, observer);
    }

    /// Drops straight into light sleep, passing through `Dimmed`. Refused
    /// while recording.
    pub fn force_light_sleep<O: DeviceLifecycleObserver>(
        &mut self,
        now_ms: u64,
        observer: &mut O,
    ) -> bool {
        if self.recording {
            return false;
        }
        match self.state {
            PowerState::Active => {
                self.enter_dimmed(now_ms, observer);
                self.enter_light_sleep(now_ms, observer);
                true
            }
            PowerState::Dimmed => {
                self.enter_light_sleep(now_ms, observer);
                true
            }
            PowerState::LightSleep | PowerState::DeepSleep => false,
        }
    }

    /// One scheduler iteration worth of battery checks and transitions.
    pub fn update<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) -> PowerStep {
        if self.state == PowerState::DeepSleep {
            return PowerStep::DeepSleepDue;
        }

        if let Some(halt) = self.check_battery(now_ms) {
            return PowerStep::Halted(halt);
        }
        self.poll_charger(now_ms, observer);

        if self.recording {
            if self.state != PowerState::Active {
                self.enter_active(now_ms, observer);
            }
            self.clock.touch(now_ms);
            self.acquire_lock();
            return PowerStep::Continue;
        }
        self.release_lock();

        let idle = self.clock.idle_ms(now_ms);
        match self.state {
            PowerState::Active => {
                if idle >= self.config.dim_timeout_ms {
                    self.enter_dimmed(now_ms, observer);
                }
            }
            PowerState::Dimmed => {
                if idle >= self.config.light_sleep_timeout_ms && !self.charging {
                    self.enter_light_sleep(now_ms, observer);
                }
            }
            PowerState::LightSleep => {
                if !self.wake_pending
                    && !self.charging
                    && self.clock.asleep_ms(now_ms) >= self.config.deep_sleep_timeout_ms
                {
                    self.release_lock();
                    self.state = PowerState::DeepSleep;
                    info!(
                        "power: deep sleep due after {}ms in light sleep",
                        self.clock.asleep_ms(now_ms)
                    );
                    observer.on_enter_state(PowerState::DeepSleep, now_ms);
                    return PowerStep::DeepSleepDue;
                }
            }
            PowerState::DeepSleep => return PowerStep::DeepSleepDue,
        }

        PowerStep::Continue
    }

    /// Coarse current estimate in milliamps.
    pub fn estimated_draw_ma(&self, link_connected: bool) -> u16 {
        let base = match self.state {
            PowerState::Active => 48,
            PowerState::Dimmed => 32,
            PowerState::LightSleep => 3,
            PowerState::DeepSleep => 0,
        };
        let link = match (link_connected, self.state) {
            (false, _) | (_, PowerState::DeepSleep) => 0,
            (true, PowerState::LightSleep) => 1,
            (true, _) => 6,
        };
        let recording = if self.recording { 22 } else { 0 };
        base + link + recording
    }

    fn check_battery(&mut self, now_ms: u64) -> Option<Halt> {
        if let Some(last) = self.last_battery_check_ms
            && now_ms.saturating_sub(last) < self.config.battery_check_interval_ms
        {
            return None;
        }
        self.last_battery_check_ms = Some(now_ms);

        let mv = match self.board.battery_voltage_mv() {
            Ok(mv) => mv,
            Err(err) => {
                debug!("power: battery read failed: {:?}", err);
                return None;
            }
        };
        self.battery_mv = Some(mv);

        if mv < self.config.critical_battery_mv && !self.charging {
            warn!("power: critical battery {}mV; shutting down", mv);
            self.board
                .show_low_battery_warning(self.config.low_battery_warning_ms);
            return Some(self.board.power_off());
        }
        if mv < self.config.low_battery_mv && !self.charging {
            warn!("power: low battery {}mV", mv);
        }
        None
    }

    fn poll_charger<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        if let Some(last) = self.last_charge_poll_ms
            && now_ms.saturating_sub(last) < self.config.charge_poll_interval_ms
        {
            return;
        }
        self.last_charge_poll_ms = Some(now_ms);

        match self.board.is_charging() {
            Ok(charging) => self.set_charging(charging, now_ms, observer),
            Err(err) => debug!("power: charger read failed: {:?}", err),
        }
    }

    fn enter_active<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        if self.state == PowerState::LightSleep
            && let Err(err) = self.board.set_display_power(true)
        {
            warn!("power: display power on failed: {:?}", err);
        }
        self.set_ceiling(CpuCeiling::Max);
        let level = self.backlight_for(PowerState::Active);
        self.board.set_backlight(level);
        self.transition(PowerState::Active, now_ms, observer);
    }

    fn enter_dimmed<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        self.set_ceiling(CpuCeiling::Reduced);
        let level = self.backlight_for(PowerState::Dimmed);
        self.board.set_backlight(level);
        self.transition(PowerState::Dimmed, now_ms, observer);
    }

    fn enter_light_sleep<O: DeviceLifecycleObserver>(&mut self, now_ms: u64, observer: &mut O) {
        self.board.set_backlight(0);
        if let Err(err) = self.board.set_display_power(false) {
            warn!("power: display power off failed: {:?}", err);
        }
        self.clock.enter_sleep(now_ms);
        self.transition(PowerState::LightSleep, now_ms, observer);
    }

    fn transition<O: DeviceLifecycleObserver>(
        &mut self,
        next: PowerState,
        now_ms: u64,
        observer: &mut O,
    ) {
        if self.state == next {
            return;
        }
        info!("power: {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
        observer.on_enter_state(next, now_ms);
    }

    fn backlight_for(&self, state: PowerState) -> u8 {
        match state {
            PowerState::Active => self.config.backlight_active,
            PowerState::Dimmed if self.charging => self.config.backlight_charging,
            PowerState::Dimmed => self.config.backlight_dim,
            PowerState::LightSleep | PowerState::DeepSleep => 0,
        }
    }

    fn set_ceiling(&mut self, ceiling: CpuCeiling) {
        if self.ceiling != ceiling {
            self.ceiling = ceiling;
            self.board.set_cpu_ceiling(ceiling);
        }
    }

    fn acquire_lock(&mut self) {
        if self.cpu_lock.acquire() {
            self.board.set_cpu_lock(true);
        }
    }

    fn release_lock(&mut self) {
        if self.cpu_lock.release() {
            self.board.set_cpu_lock(false);
        }
    }
}

#[cfg(test)]
mod tests;
