//! Scheduler core. One [`Firmware::tick`] is one main-loop iteration; the
//! binary only sleeps for the returned delay and calls it again.

use log::{debug, info, warn};

use crate::audio::AudioCapture;
use crate::clock::{ClockConfig, ClockStore, SyncKind, WallClock};
use crate::file::FileStream;
use crate::inbox::{LinkEvent, LinkInbox};
use crate::link::{Channel, ConnectivityManager, LinkConfig, Radio};
use crate::ota::{FirmwareSink, OtaConfig, OtaOutcome, OtaTransferMachine};
use crate::power::{
    DeviceLifecycleObserver, Halt, PowerBoard, PowerConfig, PowerState, PowerStateMachine,
    PowerStep, ShutdownSequence, begin_deep_sleep, finish_deep_sleep,
};
use crate::protocol::{self, Inbound, REQ_TIME};
use crate::session::{RecordingPump, Session, SessionConfig, UiState};
use crate::touch::{TouchConfig, TouchPanel, TouchTracker};

/// Concrete hardware bindings for one board.
pub trait Platform {
    type Board: PowerBoard;
    type Radio: Radio;
    type Sink: FirmwareSink;
    type Audio: AudioCapture;
    type Touch: TouchPanel;
    type Store: ClockStore;
    type Shutdown: ShutdownSequence;
}

pub struct Peripherals<P: Platform> {
    pub board: P::Board,
    pub radio: P::Radio,
    pub sink: P::Sink,
    pub audio: P::Audio,
    pub touch: P::Touch,
    pub store: P::Store,
    pub shutdown: P::Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FirmwareConfig {
    pub power: PowerConfig,
    pub link: LinkConfig,
    pub ota: OtaConfig,
    pub session: SessionConfig,
    pub clock: ClockConfig,
    pub touch: TouchConfig,
    pub recording_delay_ms: u32,
    /// OTA reception or file streaming.
    pub transfer_delay_ms: u32,
    pub light_sleep_delay_ms: u32,
    pub dimmed_frame_ms: u32,
    pub active_frame_ms: u32,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            power: PowerConfig::default(),
            link: LinkConfig::default(),
            ota: OtaConfig::default(),
            session: SessionConfig::default(),
            clock: ClockConfig::default(),
            touch: TouchConfig::default(),
            recording_delay_ms: 1,
            transfer_delay_ms: 5,
            light_sleep_delay_ms: 200,
            dimmed_frame_ms: 200,
            active_frame_ms: 50,
        }
    }
}

impl FirmwareConfig {
    pub const fn with_power(mut self, value: PowerConfig) -> Self {
        self.power = value;
        self
    }

    pub const fn with_link(mut self, value: LinkConfig) -> Self {
        self.link = value;
        self
    }

    pub const fn with_session(mut self, value: SessionConfig) -> Self {
        self.session = value;
        self
    }

    pub const fn with_clock(mut self, value: ClockConfig) -> Self {
        self.clock = value;
        self
    }
}

#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Continue { delay_ms: u32 },
    /// Deep sleep has begun and the radio teardown is queued. Call
    /// [`Firmware::finish_deep_sleep`] once the radio is down.
    RadioTeardown,
    Halt(Halt),
}

/// Components that react to power transitions.
struct Subsystems<R: Radio> {
    link: ConnectivityManager<R>,
    session: Session,
    clock: WallClock,
    touch: TouchTracker,
}

impl<R: Radio> DeviceLifecycleObserver for Subsystems<R> {
    fn on_enter_state(&mut self, state: PowerState, now_ms: u64) {
        match state {
            PowerState::LightSleep => self.link.enter_sleep_mode(now_ms),
            PowerState::Active | PowerState::Dimmed => self.link.exit_sleep_mode(now_ms),
            PowerState::DeepSleep => {}
        }
    }

    fn on_wake(&mut self, now_ms: u64) {
        self.link.on_wake(now_ms);
        self.session.go_home();
        self.clock.invalidate();
        self.touch.consume();
    }
}

pub struct Firmware<'a, P: Platform> {
    config: FirmwareConfig,
    power: PowerStateMachine<P::Board>,
    subsystems: Subsystems<P::Radio>,
    ota: OtaTransferMachine<P::Sink>,
    audio: P::Audio,
    panel: P::Touch,
    store: P::Store,
    shutdown: P::Shutdown,
    file: FileStream,
    inbox: &'a LinkInbox,
}

impl<'a, P: Platform> Firmware<'a, P> {
    pub fn new(
        peripherals: Peripherals<P>,
        inbox: &'a LinkInbox,
        config: FirmwareConfig,
        now_ms: u64,
    ) -> Self {
        Self {
            config,
            power: PowerStateMachine::new(peripherals.board, config.power, now_ms),
            subsystems: Subsystems {
                link: ConnectivityManager::new(peripherals.radio, config.link),
                session: Session::new(config.session),
                clock: WallClock::new(config.clock),
                touch: TouchTracker::new(config.touch),
            },
            ota: OtaTransferMachine::new(peripherals.sink, config.ota),
            audio: peripherals.audio,
            panel: peripherals.touch,
            store: peripherals.store,
            shutdown: peripherals.shutdown,
            file: FileStream::new(),
            inbox,
        }
    }

    /// Restores the persisted clock and starts advertising.
    pub fn start(&mut self, now_ms: u64) {
        match self.store.load() {
            Ok(Some(record)) => self.subsystems.clock.restore(record, now_ms),
            Ok(None) => debug!("firmware: no stored clock"),
            Err(err) => warn!("firmware: clock load failed: {:?}", err),
        }

        self.subsystems.link.start(now_ms);
        if !self.subsystems.clock.has_time() {
            self.subsystems.session.wait_for_time(now_ms);
        }
        info!("firmware: started ui={}", self.subsystems.session.ui().as_str());
    }

    pub fn power(&self) -> &PowerStateMachine<P::Board> {
        &self.power
    }

    pub fn power_mut(&mut self) -> &mut PowerStateMachine<P::Board> {
        &mut self.power
    }

    pub fn link(&self) -> &ConnectivityManager<P::Radio> {
        &self.subsystems.link
    }

    pub fn link_mut(&mut self) -> &mut ConnectivityManager<P::Radio> {
        &mut self.subsystems.link
    }

    pub fn session(&self) -> &Session {
        &self.subsystems.session
    }

    pub fn clock(&self) -> &WallClock {
        &self.subsystems.clock
    }

    pub fn touch(&self) -> &TouchTracker {
        &self.subsystems.touch
    }

    /// Swallows the touch that woke the device from deep sleep.
    pub fn consume_wake_touch(&mut self) {
        self.subsystems.touch.consume();
    }

    pub fn ota(&self) -> &OtaTransferMachine<P::Sink> {
        &self.ota
    }

    pub fn file(&self) -> &FileStream {
        &self.file
    }

    pub fn audio(&self) -> &P::Audio {
        &self.audio
    }

    pub fn audio_mut(&mut self) -> &mut P::Audio {
        &mut self.audio
    }

    pub fn panel_mut(&mut self) -> &mut P::Touch {
        &mut self.panel
    }

    pub fn store(&self) -> &P::Store {
        &self.store
    }

    pub fn shutdown(&self) -> &P::Shutdown {
        &self.shutdown
    }

    /// Second half of deep sleep after [`TickOutcome::RadioTeardown`].
    pub fn finish_deep_sleep(&mut self) -> Halt {
        finish_deep_sleep(&mut self.shutdown)
    }

    /// One main-loop iteration.
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        if self.power.service_wake(now_ms, &mut self.subsystems) {
            return TickOutcome::Continue { delay_ms: 0 };
        }

        match self.power.update(now_ms, &mut self.subsystems) {
            PowerStep::Continue => {}
            PowerStep::DeepSleepDue => {
                self.begin_deep_sleep(now_ms);
                return TickOutcome::RadioTeardown;
            }
            PowerStep::Halted(halt) => return TickOutcome::Halt(halt),
        }

        self.poll_touch(now_ms);
        self.drain_inbox(now_ms);

        let ota = self.ota.tick(now_ms);
        self.send_ota_statuses(&ota, now_ms);
        if ota.restart_due {
            info!("firmware: restarting into the new image");
            self.flush_clock(now_ms);
            return TickOutcome::Halt(self.shutdown.restart());
        }

        self.sync_transfer_mode(now_ms);
        self.subsystems.link.maintain(now_ms);

        if self.subsystems.session.check_waiting_timeout(now_ms) && !self.power.is_light_sleep() {
            self.power.mark_activity(now_ms, &mut self.subsystems);
        }
        let subsystems = &mut self.subsystems;
        let pump = subsystems
            .session
            .pump_recording(&mut subsystems.link, &mut self.audio, now_ms);
        if pump == RecordingPump::Stopped {
            self.power.set_recording(false, now_ms);
            self.power.mark_activity(now_ms, &mut self.subsystems);
        }

        let _ = self
            .file
            .pump(&mut self.subsystems.link, &self.audio, now_ms);

        if !self.power.is_light_sleep() {
            self.poll_time_request(now_ms);
        }
        self.persist_clock(now_ms);

        TickOutcome::Continue {
            delay_ms: self.next_delay_ms(),
        }
    }

    fn poll_touch(&mut self, now_ms: u64) {
        let state = self.power.state();
        let report = self
            .subsystems
            .touch
            .poll(&mut self.panel, state, now_ms);
        if report.activity {
            self.power.mark_activity(now_ms, &mut self.subsystems);
        }
        if report.released_after_ms.is_none() {
            return;
        }

        let touch = *self.subsystems.touch.config();
        match self.subsystems.session.ui() {
            UiState::Answer => {
                if report.is_short_release(&touch) {
                    self.subsystems.session.go_home();
                }
            }
            UiState::Idle | UiState::Recording => {
                if report.is_tap(&touch) {
                    self.toggle_recording(now_ms);
                }
            }
            UiState::WaitingTime | UiState::WaitingAnswer => {}
        }
    }

    fn toggle_recording(&mut self, now_ms: u64) {
        let subsystems = &mut self.subsystems;
        if subsystems
            .session
            .toggle_recording(&mut subsystems.link, &mut self.audio, now_ms)
        {
            let recording = self.subsystems.session.is_recording();
            self.power.set_recording(recording, now_ms);
            self.power.mark_activity(now_ms, &mut self.subsystems);
        }
    }

    fn drain_inbox(&mut self, now_ms: u64) {
        let inbox = self.inbox;

        let lost = inbox.take_overflows();
        if lost > 0 {
            warn!("firmware: {} inbound writes lost", lost);
            let outcome = self.ota.on_inbound_overflow();
            self.send_ota_statuses(&outcome, now_ms);
        }

        while let Some(event) = inbox.pop(now_ms) {
            self.handle_event(event, now_ms);
        }
    }

    fn handle_event(&mut self, event: LinkEvent, now_ms: u64) {
        match event {
            LinkEvent::Connected { peer, handle } => {
                self.subsystems.link.on_connect(peer, handle, now_ms);
                self.subsystems.clock.on_connected();
                self.power.mark_activity(now_ms, &mut self.subsystems);
            }
            LinkEvent::Disconnected => {
                self.subsystems.link.on_disconnect(now_ms);
                self.subsystems.session.on_disconnect(&mut self.audio);
                self.subsystems.clock.on_disconnected();
                self.ota.on_disconnect();
                self.file.cancel();
                self.power.set_recording(false, now_ms);
            }
            LinkEvent::Subscribed(enabled) => {
                self.subsystems.link.set_notifications_enabled(enabled);
            }
            LinkEvent::OtaWrite(data) => self.handle_ota_write(&data, now_ms),
            LinkEvent::FileRequest => {
                if self.subsystems.session.is_recording() {
                    debug!("firmware: file request ignored while recording");
                } else {
                    let _ = self.file.request(&self.audio);
                }
            }
            LinkEvent::Text(raw) => self.handle_text(&raw, now_ms),
        }
    }

    fn handle_ota_write(&mut self, data: &[u8], now_ms: u64) {
        if data.starts_with(b"BEGIN:") && self.subsystems.session.is_recording() {
            info!("firmware: firmware update preempts recording");
            let subsystems = &mut self.subsystems;
            subsystems
                .session
                .stop_recording(&mut subsystems.link, &mut self.audio, now_ms);
            self.power.set_recording(false, now_ms);
        }

        let outcome = self.ota.handle_write(data, now_ms);
        if outcome.activity {
            self.power.mark_activity(now_ms, &mut self.subsystems);
        }
        self.send_ota_statuses(&outcome, now_ms);
    }

    fn handle_text(&mut self, raw: &[u8], now_ms: u64) {
        match protocol::parse_inbound(raw) {
            Inbound::Time(sync) => {
                let waiting = self.subsystems.session.ui() == UiState::WaitingTime;
                let kind = self.subsystems.clock.apply(sync, now_ms, waiting);
                self.subsystems.session.on_time_synced();
                if kind == SyncKind::Foreground {
                    self.power.mark_activity(now_ms, &mut self.subsystems);
                }
            }
            Inbound::Reply(text) => {
                self.subsystems.session.on_reply(text);
                self.power.mark_activity(now_ms, &mut self.subsystems);
            }
            Inbound::Ignored => debug!("firmware: ignoring {} byte text write", raw.len()),
        }
    }

    fn send_ota_statuses(&mut self, outcome: &OtaOutcome, now_ms: u64) {
        for status in outcome.statuses.iter() {
            let line = status.encode();
            if let Err(err) =
                self.subsystems
                    .link
                    .send_with_retry(Channel::Ota, line.as_bytes(), now_ms)
            {
                debug!("firmware: ota status {} not sent: {:?}", line.as_str(), err);
            }
        }
    }

    fn sync_transfer_mode(&mut self, now_ms: u64) {
        if !self.subsystems.link.is_connected() {
            return;
        }
        let active = self.subsystems.session.is_recording()
            || self.ota.is_receiving()
            || self.file.is_active();
        let _ = self.subsystems.link.request_transfer_mode(active, now_ms);
    }

    fn poll_time_request(&mut self, now_ms: u64) {
        let can_send = self.subsystems.link.can_send_control();
        if !self.subsystems.clock.poll(now_ms, can_send) {
            return;
        }
        let delivered = self
            .subsystems
            .link
            .send_with_retry(Channel::Control, REQ_TIME, now_ms)
            .is_ok();
        self.subsystems.clock.on_request(now_ms, delivered);
    }

    fn persist_clock(&mut self, now_ms: u64) {
        if let Some(record) = self.subsystems.clock.take_persist(now_ms)
            && let Err(err) = self.store.save(&record)
        {
            warn!("firmware: clock save failed: {:?}", err);
        }
    }

    fn flush_clock(&mut self, now_ms: u64) {
        if let Some(record) = self.subsystems.clock.record(now_ms)
            && let Err(err) = self.store.save(&record)
        {
            warn!("firmware: clock flush failed: {:?}", err);
        }
    }

    fn begin_deep_sleep(&mut self, now_ms: u64) {
        self.flush_clock(now_ms);
        self.file.cancel();
        begin_deep_sleep(&mut self.audio, &mut self.shutdown);
    }

    fn next_delay_ms(&self) -> u32 {
        if self.subsystems.session.is_recording() {
            return self.config.recording_delay_ms;
        }
        if self.ota.is_receiving() || self.file.is_active() {
            return self.config.transfer_delay_ms;
        }
        match self.power.state() {
            PowerState::LightSleep | PowerState::DeepSleep => self.config.light_sleep_delay_ms,
            PowerState::Dimmed => self.config.dimmed_frame_ms,
            PowerState::Active => self.config.active_frame_ms,
        }
    }
}
