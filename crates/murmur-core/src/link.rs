//! Wireless session owner: advertising cadence, connection parameters,
//! notification delivery, and link health.

use core::fmt::Debug;

use log::{debug, info, warn};

/// Connection parameter tuple. Intervals in 1.25 ms units, supervision
/// timeout in 10 ms units.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl ConnParams {
    pub const NORMAL: Self = Self::new(60, 120, 1, 500);
    pub const ACTIVE: Self = Self::new(8, 16, 0, 300);
    pub const SLEEP: Self = Self::new(200, 400, 4, 600);

    pub const fn new(interval_min: u16, interval_max: u16, latency: u16, timeout: u16) -> Self {
        Self {
            interval_min,
            interval_max,
            latency,
            supervision_timeout: timeout,
        }
    }

    pub const fn interval_min_us(self) -> u32 {
        self.interval_min as u32 * 1_250
    }

    pub const fn interval_max_us(self) -> u32 {
        self.interval_max as u32 * 1_250
    }

    pub const fn supervision_timeout_ms(self) -> u32 {
        self.supervision_timeout as u32 * 10
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkMode {
    Normal,
    /// Low-latency parameters for bulk data.
    Active,
    Sleep,
}

impl LinkMode {
    pub const fn params(self) -> ConnParams {
        match self {
            Self::Normal => ConnParams::NORMAL,
            Self::Active => ConnParams::ACTIVE,
            Self::Sleep => ConnParams::SLEEP,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Active => "active",
            Self::Sleep => "sleep",
        }
    }
}

/// Advertising interval pair in 0.625 ms units.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdvInterval {
    pub min: u16,
    pub max: u16,
}

impl AdvInterval {
    pub const fn min_us(self) -> u32 {
        self.min as u32 * 625
    }

    pub const fn max_us(self) -> u32 {
        self.max as u32 * 625
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdvertisingProfile {
    Fast,
    Normal,
    Sleep,
}

impl AdvertisingProfile {
    pub const fn interval(self) -> AdvInterval {
        match self {
            Self::Fast => AdvInterval {
                min: 0x0020,
                max: 0x0030,
            },
            Self::Normal => AdvInterval {
                min: 0x0320,
                max: 0x0640,
            },
            Self::Sleep => AdvInterval {
                min: 0x0640,
                max: 0x0C80,
            },
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Normal => "normal",
            Self::Sleep => "sleep",
        }
    }
}

/// Notify endpoint exposed to the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Channel {
    /// Audio frames and control messages.
    Control,
    File,
    Ota,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerAddress(pub [u8; 6]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionSession {
    pub peer: PeerAddress,
    pub handle: u16,
    mode: Option<LinkMode>,
    pending_mode: Option<LinkMode>,
    last_param_request_ms: Option<u64>,
    last_success_ms: u64,
    notifications_enabled: bool,
}

impl ConnectionSession {
    fn new(peer: PeerAddress, handle: u16, now_ms: u64) -> Self {
        Self {
            peer,
            handle,
            mode: None,
            pending_mode: None,
            last_param_request_ms: None,
            last_success_ms: now_ms,
            notifications_enabled: false,
        }
    }

    pub fn mode(&self) -> Option<LinkMode> {
        self.mode
    }

    /// True while low-latency parameters are in effect.
    pub fn active_transfer(&self) -> bool {
        self.mode == Some(LinkMode::Active)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled
    }
}

/// Radio operations the manager issues. Implementations forward to the
/// host stack and must not block on the peer.
pub trait Radio {
    type Error: Debug;

    fn start_advertising(&mut self, profile: AdvertisingProfile) -> Result<(), Self::Error>;
    fn update_conn_params(&mut self, handle: u16, params: ConnParams) -> Result<(), Self::Error>;
    fn notify(&mut self, channel: Channel, payload: &[u8]) -> Result<(), Self::Error>;
    fn is_connected(&self) -> bool;
    fn delay_ms(&mut self, ms: u32);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkConfig {
    pub fast_window_ms: u64,
    pub param_throttle_ms: u64,
    pub notify_attempts: u8,
    pub retry_delay_ms: u32,
    pub health_window_ms: u64,
    pub advertising_kick_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            fast_window_ms: 30_000,
            param_throttle_ms: 1_500,
            notify_attempts: 3,
            retry_delay_ms: 10,
            health_window_ms: 5_000,
            advertising_kick_ms: 30_000,
        }
    }
}

impl LinkConfig {
    pub const fn with_fast_window_ms(mut self, value: u64) -> Self {
        self.fast_window_ms = value;
        self
    }

    pub const fn with_notify_attempts(mut self, value: u8) -> Self {
        self.notify_attempts = value;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamRequest {
    Sent,
    AlreadyInMode,
    /// Inside the throttle window; applied by `maintain` once it closes.
    Deferred,
    Rejected,
    NoSession,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkError {
    NotConnected,
    Dropped,
    Exhausted,
}

pub struct ConnectivityManager<R: Radio> {
    radio: R,
    config: LinkConfig,
    session: Option<ConnectionSession>,
    profile: AdvertisingProfile,
    advertising: bool,
    fast_until_ms: u64,
    last_kick_ms: u64,
    sleep_mode: bool,
    notify_errors: u32,
    param_errors: u32,
}

impl<R: Radio> ConnectivityManager<R> {
    pub fn new(radio: R, config: LinkConfig) -> Self {
        Self {
            radio,
            config,
            session: None,
            profile: AdvertisingProfile::Fast,
            advertising: false,
            fast_until_ms: 0,
            last_kick_ms: 0,
            sleep_mode: false,
            notify_errors: 0,
            param_errors: 0,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn profile(&self) -> AdvertisingProfile {
        self.profile
    }

    pub fn in_sleep_mode(&self) -> bool {
        self.sleep_mode
    }

    /// Opens the fast advertising window and starts broadcasting.
    pub fn start(&mut self, now_ms: u64) {
        self.fast_until_ms = now_ms.saturating_add(self.config.fast_window_ms);
        self.advertise(AdvertisingProfile::Fast, now_ms);
    }

    pub fn on_connect(&mut self, peer: PeerAddress, handle: u16, now_ms: u64) {
        info!("link: connected handle={} peer={:02x?}", handle, peer.0);
        self.session = Some(ConnectionSession::new(peer, handle, now_ms));
        self.advertising = false;
        self.notify_errors = 0;
        self.param_errors = 0;
        let mode = if self.sleep_mode {
            LinkMode::Sleep
        } else {
            LinkMode::Normal
        };
        let _ = self.request_mode(mode, now_ms);
    }

    /// Clears the session and restarts broadcasting right away.
    pub fn on_disconnect(&mut self, now_ms: u64) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(
            "link: disconnected handle={} notify_errors={} param_errors={}",
            session.handle, self.notify_errors, self.param_errors
        );
        let profile = self.desired_profile(now_ms);
        self.advertise(profile, now_ms);
    }

    pub fn set_notifications_enabled(&mut self, enabled: bool) {
        if let Some(session) = self.session.as_mut() {
            session.notifications_enabled = enabled;
            debug!("link: notifications enabled={}", enabled);
        }
    }

    pub fn can_send_control(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.notifications_enabled)
    }

    /// Switches between low-latency and normal parameters.
    pub fn request_transfer_mode(&mut self, active: bool, now_ms: u64) -> ParamRequest {
        let mode = match (active, self.sleep_mode) {
            (true, _) => LinkMode::Active,
            (false, true) => LinkMode::Sleep,
            (false, false) => LinkMode::Normal,
        };
        self.request_mode(mode, now_ms)
    }

    /// Idempotent and throttled parameter renegotiation.
    pub fn request_mode(&mut self, mode: LinkMode, now_ms: u64) -> ParamRequest {
        let throttle_ms = self.config.param_throttle_ms;
        let Some(session) = self.session.as_mut() else {
            return ParamRequest::NoSession;
        };

        if session.mode == Some(mode) {
            session.pending_mode = None;
            return ParamRequest::AlreadyInMode;
        }

        if let Some(last) = session.last_param_request_ms
            && now_ms.saturating_sub(last) < throttle_ms
        {
            session.pending_mode = Some(mode);
            return ParamRequest::Deferred;
        }

        session.mode = Some(mode);
        session.pending_mode = None;
        session.last_param_request_ms = Some(now_ms);
        let handle = session.handle;

        match self.radio.update_conn_params(handle, mode.params()) {
            Ok(()) => {
                info!("link: -> {} params", mode.as_str());
                ParamRequest::Sent
            }
            Err(err) => {
                warn!("link: param update to {} failed: {:?}", mode.as_str(), err);
                self.param_errors = self.param_errors.saturating_add(1);
                ParamRequest::Rejected
            }
        }
    }

    pub fn enter_sleep_mode(&mut self, now_ms: u64) {
        if self.sleep_mode {
            return;
        }
        self.sleep_mode = true;
        self.fast_until_ms = now_ms;

        if self.is_connected() {
            let _ = self.request_mode(LinkMode::Sleep, now_ms);
        } else {
            self.advertise(AdvertisingProfile::Sleep, now_ms);
        }
    }

    pub fn exit_sleep_mode(&mut self, now_ms: u64) {
        if !self.sleep_mode {
            return;
        }
        self.sleep_mode = false;

        if self.is_connected() {
            let _ = self.request_mode(LinkMode::Normal, now_ms);
        } else {
            let profile = self.desired_profile(now_ms);
            self.advertise(profile, now_ms);
        }
    }

    /// Reopens the fast advertising window after a wake.
    pub fn on_wake(&mut self, now_ms: u64) {
        self.fast_until_ms = now_ms.saturating_add(self.config.fast_window_ms);
        if !self.is_connected() && self.profile != AdvertisingProfile::Fast {
            self.advertise(AdvertisingProfile::Fast, now_ms);
        }
    }

    /// Delivers a notification with bounded retries. Success means the link
    /// was still up right after the send.
    pub fn send_with_retry(
        &mut self,
        channel: Channel,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<(), LinkError> {
        if self.session.is_none() {
            return Err(LinkError::NotConnected);
        }

        let attempts = self.config.notify_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                self.radio.delay_ms(self.config.retry_delay_ms);
            }

            let sent = self.radio.notify(channel, payload);
            if !self.radio.is_connected() {
                self.notify_errors = self.notify_errors.saturating_add(1);
                debug!("link: peer dropped during notify on {:?}", channel);
                return Err(LinkError::Dropped);
            }
            match sent {
                Ok(()) => {
                    if let Some(session) = self.session.as_mut() {
                        session.last_success_ms = now_ms;
                    }
                    return Ok(());
                }
                Err(err) => debug!("link: notify attempt {} failed: {:?}", attempt + 1, err),
            }
        }

        self.notify_errors = self.notify_errors.saturating_add(1);
        Err(LinkError::Exhausted)
    }

    /// Liveness signal only; callers decide what to do about it.
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        self.session.as_ref().is_some_and(|session| {
            now_ms.saturating_sub(session.last_success_ms) < self.config.health_window_ms
        })
    }

    pub fn error_count(&self) -> u32 {
        self.notify_errors.saturating_add(self.param_errors)
    }

    pub fn reset_errors(&mut self) {
        self.notify_errors = 0;
        self.param_errors = 0;
    }

    /// Per-iteration upkeep: deferred parameter changes while connected,
    /// fast-window decay and the periodic advertising re-kick otherwise.
    pub fn maintain(&mut self, now_ms: u64) {
        if let Some(session) = self.session {
            if let Some(pending) = session.pending_mode
                && session
                    .last_param_request_ms
                    .is_none_or(|last| now_ms.saturating_sub(last) >= self.config.param_throttle_ms)
            {
                let _ = self.request_mode(pending, now_ms);
            }
            return;
        }

        let desired = self.desired_profile(now_ms);
        if desired != self.profile {
            self.advertise(desired, now_ms);
        } else if now_ms.saturating_sub(self.last_kick_ms) >= self.config.advertising_kick_ms {
            debug!("link: advertising re-kick");
            self.advertise(desired, now_ms);
        }
    }

    fn desired_profile(&self, now_ms: u64) -> AdvertisingProfile {
        if now_ms < self.fast_until_ms {
            AdvertisingProfile::Fast
        } else if self.sleep_mode {
            AdvertisingProfile::Sleep
        } else {
            AdvertisingProfile::Normal
        }
    }

    fn advertise(&mut self, profile: AdvertisingProfile, now_ms: u64) {
        self.profile = profile;
        self.last_kick_ms = now_ms;
        match self.radio.start_advertising(profile) {
            Ok(()) => {
                self.advertising = true;
                debug!("link: advertising profile={}", profile.as_str());
            }
            Err(err) => {
                self.advertising = false;
                warn!("link: advertising start failed: {:?}", err);
            }
        }
    }
}
