use super::*;
use crate::audio::{AUDIO_FRAME_BYTES, AudioCapture};

#[derive(Default)]
struct FakeBoard {
    ceilings: Vec<CpuCeiling>,
    lock_changes: Vec<bool>,
    display: Vec<bool>,
    backlight: Vec<u8>,
    battery_mv: u16,
    charging: bool,
    warnings: u32,
    powered_off: bool,
}

impl FakeBoard {
    fn healthy() -> Self {
        Self {
            battery_mv: 3_900,
            ..Self::default()
        }
    }
}

impl PowerBoard for FakeBoard {
    type Error = ();

    fn set_cpu_ceiling(&mut self, ceiling: CpuCeiling) {
        self.ceilings.push(ceiling);
    }

    fn set_cpu_lock(&mut self, held: bool) {
        self.lock_changes.push(held);
    }

    fn set_display_power(&mut self, on: bool) -> Result<(), Self::Error> {
        self.display.push(on);
        Ok(())
    }

    fn set_backlight(&mut self, level: u8) {
        self.backlight.push(level);
    }

    fn battery_voltage_mv(&mut self) -> Result<u16, Self::Error> {
        Ok(self.battery_mv)
    }

    fn is_charging(&mut self) -> Result<bool, Self::Error> {
        Ok(self.charging)
    }

    fn show_low_battery_warning(&mut self, _hold_ms: u32) {
        self.warnings += 1;
    }

    fn power_off(&mut self) -> Halt {
        self.powered_off = true;
        Halt::Shutdown
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Seen {
    Enter(PowerState),
    Wake,
}

#[derive(Default)]
struct Journal {
    seen: Vec<Seen>,
}

impl DeviceLifecycleObserver for Journal {
    fn on_enter_state(&mut self, state: PowerState, _now_ms: u64) {
        self.seen.push(Seen::Enter(state));
    }

    fn on_wake(&mut self, _now_ms: u64) {
        self.seen.push(Seen::Wake);
    }
}

fn machine() -> PowerStateMachine<FakeBoard> {
    PowerStateMachine::new(FakeBoard::healthy(), PowerConfig::default(), 0)
}

fn drive_to_light_sleep(pm: &mut PowerStateMachine<FakeBoard>, obs: &mut Journal) -> u64 {
    assert_eq!(pm.update(10_000, obs), PowerStep::Continue);
    assert_eq!(pm.state(), PowerState::Dimmed);
    assert_eq!(pm.update(20_000, obs), PowerStep::Continue);
    assert_eq!(pm.state(), PowerState::LightSleep);
    20_000
}

#[test]
fn idle_device_dims_before_light_sleep() {
    let mut pm = machine();
    let mut obs = Journal::default();

    assert_eq!(pm.update(9_999, &mut obs), PowerStep::Continue);
    assert_eq!(pm.state(), PowerState::Active);

    // Long past both timeouts, still only one step per update.
    assert_eq!(pm.update(60_000, &mut obs), PowerStep::Continue);
    assert_eq!(pm.state(), PowerState::Dimmed);
    assert_eq!(pm.ceiling(), CpuCeiling::Reduced);
    assert_eq!(pm.board().backlight.last(), Some(&12));

    assert_eq!(pm.update(60_010, &mut obs), PowerStep::Continue);
    assert_eq!(pm.state(), PowerState::LightSleep);
    assert_eq!(pm.board().backlight.last(), Some(&0));
    assert_eq!(pm.board().display.last(), Some(&false));
    assert_eq!(
        obs.seen,
        vec![
            Seen::Enter(PowerState::Dimmed),
            Seen::Enter(PowerState::LightSleep)
        ]
    );
}

#[test]
fn activity_while_dimmed_restores_active() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let _ = pm.update(10_000, &mut obs);
    assert!(pm.is_dimmed());

    pm.mark_activity(10_500, &mut obs);

    assert!(pm.is_active());
    assert!(!pm.wake_pending());
    assert_eq!(pm.ceiling(), CpuCeiling::Max);
    assert_eq!(pm.board().backlight.last(), Some(&70));
    assert_eq!(pm.idle_ms(11_000), 500);
}

#[test]
fn activity_in_light_sleep_only_raises_wake_flag() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let now = drive_to_light_sleep(&mut pm, &mut obs);
    obs.seen.clear();

    pm.mark_activity(now + 100, &mut obs);

    assert!(pm.is_light_sleep());
    assert!(pm.wake_pending());
    assert!(obs.seen.is_empty());
}

#[test]
fn wake_service_puts_pixels_up_before_link_bookkeeping() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let now = drive_to_light_sleep(&mut pm, &mut obs);
    obs.seen.clear();
    pm.mark_activity(now + 100, &mut obs);

    assert!(pm.service_wake(now + 110, &mut obs));

    assert!(pm.is_active());
    assert!(!pm.wake_pending());
    assert_eq!(obs.seen, vec![Seen::Wake, Seen::Enter(PowerState::Active)]);
    assert_eq!(pm.board().display.last(), Some(&true));
    assert_eq!(pm.board().lock_changes, vec![true, false]);
    assert!(!pm.cpu_lock().is_held());

    assert!(!pm.service_wake(now + 120, &mut obs));
}

#[test]
fn recording_forces_active_and_holds_the_lock() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let _ = pm.update(10_000, &mut obs);
    assert!(pm.is_dimmed());

    pm.set_recording(true, 10_100);
    for step in 0..50u64 {
        let now = 10_200 + step * 30_000;
        assert_eq!(pm.update(now, &mut obs), PowerStep::Continue);
        assert_eq!(pm.state(), PowerState::Active);
        assert!(pm.cpu_lock().is_held());
        assert!(pm.cpu_lock().holders() <= 1);
    }
    assert_eq!(pm.board().lock_changes, vec![true]);

    pm.set_recording(false, 1_600_000);
    let _ = pm.update(1_600_010, &mut obs);
    assert!(!pm.cpu_lock().is_held());
    assert_eq!(pm.board().lock_changes, vec![true, false]);
}

#[test]
fn force_light_sleep_is_refused_while_recording() {
    let mut pm = machine();
    let mut obs = Journal::default();
    pm.set_recording(true, 0);

    assert!(!pm.force_light_sleep(100, &mut obs));
    assert!(pm.is_active());

    pm.set_recording(false, 200);
    assert!(pm.force_light_sleep(300, &mut obs));
    assert_eq!(
        obs.seen,
        vec![
            Seen::Enter(PowerState::Dimmed),
            Seen::Enter(PowerState::LightSleep)
        ]
    );
}

#[test]
fn deep_sleep_is_due_after_time_in_light_sleep() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let entered = drive_to_light_sleep(&mut pm, &mut obs);

    assert_eq!(pm.update(entered + 279_999, &mut obs), PowerStep::Continue);
    assert_eq!(pm.update(entered + 280_000, &mut obs), PowerStep::DeepSleepDue);
    assert_eq!(pm.state(), PowerState::DeepSleep);
    assert!(!pm.cpu_lock().is_held());
    assert_eq!(obs.seen.last(), Some(&Seen::Enter(PowerState::DeepSleep)));
}

#[test]
fn charging_blocks_sleep_and_lifts_light_sleep_to_dimmed() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let entered = drive_to_light_sleep(&mut pm, &mut obs);

    pm.board_mut().charging = true;
    assert_eq!(pm.update(entered + 280_000, &mut obs), PowerStep::Continue);
    assert!(pm.is_dimmed());
    assert!(!pm.wake_pending());
    assert_eq!(pm.board().backlight.last(), Some(&50));

    // Plugged in: no light sleep no matter how long it idles.
    assert_eq!(pm.update(entered + 900_000, &mut obs), PowerStep::Continue);
    assert!(pm.is_dimmed());
}

#[test]
fn critical_battery_shuts_down_after_warning() {
    let mut board = FakeBoard::healthy();
    board.battery_mv = 2_650;
    let mut pm = PowerStateMachine::new(board, PowerConfig::default(), 0);
    let mut obs = Journal::default();

    assert_eq!(pm.update(0, &mut obs), PowerStep::Halted(Halt::Shutdown));
    assert_eq!(pm.board().warnings, 1);
    assert!(pm.board().powered_off);
}

#[test]
fn critical_battery_is_tolerated_while_charging() {
    let mut board = FakeBoard::healthy();
    board.battery_mv = 2_650;
    board.charging = true;
    let mut pm = PowerStateMachine::new(board, PowerConfig::default(), 0);
    let mut obs = Journal::default();

    pm.set_charging(true, 0, &mut obs);
    assert_eq!(pm.update(0, &mut obs), PowerStep::Continue);
    assert!(!pm.board().powered_off);
}

#[test]
fn battery_is_sampled_on_its_own_interval() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let _ = pm.update(0, &mut obs);
    assert_eq!(pm.battery_mv(), Some(3_900));

    pm.board_mut().battery_mv = 2_500;
    assert_eq!(pm.update(5_000, &mut obs), PowerStep::Continue);
    assert_eq!(pm.update(10_000, &mut obs), PowerStep::Halted(Halt::Shutdown));
}

#[test]
fn transitions_follow_the_table_for_any_activity_pattern() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let mut seed = 0x2545_F491u32;
    let mut now = 0u64;
    let mut previous = pm.state();

    for _ in 0..5_000 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        now += u64::from(seed % 4_000);

        if seed % 7 == 0 {
            pm.mark_activity(now, &mut obs);
        }
        let _ = pm.service_wake(now, &mut obs);
        if pm.update(now, &mut obs) == PowerStep::DeepSleepDue {
            break;
        }

        let current = pm.state();
        let allowed = matches!(
            (previous, current),
            (a, b) if a == b
        ) || matches!(
            (previous, current),
            (PowerState::Active, PowerState::Dimmed)
                | (PowerState::Dimmed, PowerState::Active)
                | (PowerState::Dimmed, PowerState::LightSleep)
                | (PowerState::LightSleep, PowerState::Active)
                | (PowerState::LightSleep, PowerState::Dimmed)
        );
        assert!(allowed, "{:?} -> {:?}", previous, current);
        assert!(pm.cpu_lock().holders() <= 1);
        previous = current;
    }
}

#[derive(Default)]
struct Steps {
    log: Vec<&'static str>,
}

impl AudioCapture for Steps {
    type Error = ();

    fn start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn stop(&mut self) {
        self.log.push("audio_stop");
    }

    fn release(&mut self) {
        self.log.push("audio_release");
    }

    fn next_frame(&mut self, _out: &mut [u8; AUDIO_FRAME_BYTES]) -> Option<usize> {
        None
    }

    fn recorded_len(&self) -> u32 {
        0
    }

    fn read_recorded(&self, _offset: u32, _out: &mut [u8]) -> usize {
        0
    }
}

struct Sequence<'a> {
    log: &'a mut Vec<&'static str>,
    arm_fails: bool,
}

impl ShutdownSequence for Sequence<'_> {
    fn sleep_display(&mut self) {
        self.log.push("display");
    }

    fn teardown_radio(&mut self) {
        self.log.push("radio");
    }

    fn cut_rails(&mut self) {
        self.log.push("rails");
    }

    fn touch_monitor_mode(&mut self) {
        self.log.push("touch_monitor");
    }

    fn arm_wake_sources(&mut self) -> Result<(), ArmError> {
        self.log.push("arm");
        if self.arm_fails { Err(ArmError) } else { Ok(()) }
    }

    fn sleep(&mut self) -> Halt {
        self.log.push("sleep");
        Halt::DeepSleep
    }

    fn restart(&mut self) -> Halt {
        self.log.push("restart");
        Halt::Restart
    }
}

#[test]
fn deep_sleep_preparation_runs_in_order() {
    let mut audio = Steps::default();
    let mut log = Vec::new();
    let mut seq = Sequence {
        log: &mut log,
        arm_fails: false,
    };

    assert_eq!(enter_deep_sleep(&mut audio, &mut seq), Halt::DeepSleep);
    assert_eq!(audio.log, vec!["audio_stop", "audio_release"]);
    assert_eq!(
        log,
        vec!["display", "radio", "rails", "touch_monitor", "arm", "sleep"]
    );
}

#[test]
fn deep_sleep_pauses_after_the_radio_request() {
    let mut audio = Steps::default();
    let mut log = Vec::new();
    {
        let mut seq = Sequence {
            log: &mut log,
            arm_fails: false,
        };
        begin_deep_sleep(&mut audio, &mut seq);
    }
    assert_eq!(log, vec!["display", "radio"]);

    let mut seq = Sequence {
        log: &mut log,
        arm_fails: false,
    };
    assert_eq!(finish_deep_sleep(&mut seq), Halt::DeepSleep);
    assert_eq!(
        log,
        vec!["display", "radio", "rails", "touch_monitor", "arm", "sleep"]
    );
}

#[test]
fn failed_wake_arming_restarts_instead_of_sleeping() {
    let mut audio = Steps::default();
    let mut log = Vec::new();
    let mut seq = Sequence {
        log: &mut log,
        arm_fails: true,
    };

    assert_eq!(enter_deep_sleep(&mut audio, &mut seq), Halt::Restart);
    assert_eq!(log.last(), Some(&"restart"));
    assert!(!log.contains(&"sleep"));
}

#[test]
fn estimated_draw_tracks_state() {
    let mut pm = machine();
    let mut obs = Journal::default();
    let awake = pm.estimated_draw_ma(true);
    let _ = drive_to_light_sleep(&mut pm, &mut obs);
    assert!(pm.estimated_draw_ma(true) < awake);
}
