//! Wall-clock time learned from the peer.
//!
//! The device has no RTC battery; time comes from `TIME:` replies to
//! `REQ_TIME` and is carried forward with the monotonic uptime counter.

use core::fmt::Debug;

use log::{debug, info};

use crate::protocol::TimeSync;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockConfig {
    pub retry_interval_ms: u64,
    pub max_attempts: u8,
    /// Pause after `max_attempts` unanswered requests before starting over.
    pub backoff_ms: u64,
    pub resync_interval_ms: u64,
    /// Minimum spacing between persisted records.
    pub persist_interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 7_000,
            max_attempts: 5,
            backoff_ms: 4 * 7_000,
            resync_interval_ms: 60_000,
            persist_interval_ms: 15 * 60 * 1_000,
        }
    }
}

impl ClockConfig {
    pub const fn with_resync_interval_ms(mut self, value: u64) -> Self {
        self.resync_interval_ms = value;
        self
    }

    pub const fn with_persist_interval_ms(mut self, value: u64) -> Self {
        self.persist_interval_ms = value;
        self
    }
}

/// Whether a sync happened while the user was waiting for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncKind {
    /// The UI was blocked on time; counts as user-visible activity.
    Foreground,
    /// Routine refresh; must not disturb power state.
    Background,
}

/// Persisted clock snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockRecord {
    pub epoch_s: i64,
    pub offset_s: i32,
}

pub trait ClockStore {
    type Error: Debug;

    fn load(&mut self) -> Result<Option<ClockRecord>, Self::Error>;
    fn save(&mut self, record: &ClockRecord) -> Result<(), Self::Error>;
}

/// A board without a clock partition runs without persistence.
impl<S: ClockStore> ClockStore for Option<S> {
    type Error = S::Error;

    fn load(&mut self) -> Result<Option<ClockRecord>, Self::Error> {
        match self {
            Some(store) => store.load(),
            None => Ok(None),
        }
    }

    fn save(&mut self, record: &ClockRecord) -> Result<(), Self::Error> {
        match self {
            Some(store) => store.save(record),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Anchor {
    epoch_s: i64,
    offset_s: i32,
    at_ms: u64,
}

pub struct WallClock {
    config: ClockConfig,
    anchor: Option<Anchor>,
    waiting: bool,
    attempts: u8,
    last_request_ms: Option<u64>,
    dirty: bool,
    last_persist_ms: Option<u64>,
    redraw: bool,
}

impl WallClock {
    pub const fn new(config: ClockConfig) -> Self {
        Self {
            config,
            anchor: None,
            waiting: false,
            attempts: 0,
            last_request_ms: None,
            dirty: false,
            last_persist_ms: None,
            redraw: false,
        }
    }

    pub fn has_time(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// UTC seconds at `now_ms`.
    pub fn epoch_s(&self, now_ms: u64) -> Option<i64> {
        self.anchor.map(|anchor| {
            let elapsed_s = (now_ms.saturating_sub(anchor.at_ms) / 1_000) as i64;
            anchor.epoch_s.saturating_add(elapsed_s)
        })
    }

    /// Local seconds at `now_ms`.
    pub fn local_epoch_s(&self, now_ms: u64) -> Option<i64> {
        let offset = self.anchor?.offset_s;
        self.epoch_s(now_ms)
            .map(|epoch| epoch.saturating_add(i64::from(offset)))
    }

    /// Seeds the clock from a persisted record. Any later sync replaces it.
    pub fn restore(&mut self, record: ClockRecord, now_ms: u64) {
        if record.epoch_s <= 0 || self.anchor.is_some() {
            return;
        }
        info!("clock: restored epoch={}", record.epoch_s);
        self.anchor = Some(Anchor {
            epoch_s: record.epoch_s,
            offset_s: record.offset_s,
            at_ms: now_ms,
        });
        self.redraw = true;
    }

    /// Returns true when a `REQ_TIME` should go out now. The caller reports
    /// the send result through [`Self::on_request`].
    pub fn poll(&mut self, now_ms: u64, can_send: bool) -> bool {
        if !can_send {
            return false;
        }

        let since_request = self
            .last_request_ms
            .map_or(u64::MAX, |last| now_ms.saturating_sub(last));

        if !self.waiting {
            if self.has_time() {
                return since_request >= self.config.resync_interval_ms;
            }
            return self.attempts == 0;
        }

        if self.attempts < self.config.max_attempts {
            return since_request > self.config.retry_interval_ms;
        }

        if since_request > self.config.backoff_ms {
            debug!("clock: request backoff over; starting again");
            self.attempts = 0;
        }
        false
    }

    /// Records a request attempt. An undelivered request is not counted and
    /// is retried on the next retry tick.
    pub fn on_request(&mut self, now_ms: u64, delivered: bool) {
        self.waiting = true;
        if delivered {
            self.attempts = self.attempts.saturating_add(1);
            self.last_request_ms = Some(now_ms);
            debug!("clock: time requested attempt={}", self.attempts);
        } else {
            self.last_request_ms = Some(now_ms.saturating_sub(self.config.retry_interval_ms));
        }
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.waiting = false;
        self.last_request_ms = None;
    }

    pub fn on_disconnected(&mut self) {
        self.attempts = 0;
        self.waiting = false;
    }

    /// Applies a peer time update. `ui_waiting_for_time` is sampled by the
    /// caller at arrival; the kind is decided before the clock changes.
    pub fn apply(&mut self, sync: TimeSync, now_ms: u64, ui_waiting_for_time: bool) -> SyncKind {
        let kind = if self.has_time() && !ui_waiting_for_time {
            SyncKind::Background
        } else {
            SyncKind::Foreground
        };

        self.anchor = Some(Anchor {
            epoch_s: sync.epoch_s,
            offset_s: sync.offset_s,
            at_ms: now_ms,
        });
        self.waiting = false;
        self.attempts = 0;
        self.dirty = true;
        self.redraw = true;
        info!(
            "clock: synced epoch={} offset_s={} kind={:?}",
            sync.epoch_s, sync.offset_s, kind
        );
        kind
    }

    /// Flags the clock face for redraw.
    pub fn invalidate(&mut self) {
        self.redraw = true;
    }

    pub fn take_redraw(&mut self) -> bool {
        core::mem::take(&mut self.redraw)
    }

    pub fn record(&self, now_ms: u64) -> Option<ClockRecord> {
        let anchor = self.anchor?;
        Some(ClockRecord {
            epoch_s: self.epoch_s(now_ms)?,
            offset_s: anchor.offset_s,
        })
    }

    /// Record to write if a sync happened and the persist interval allows.
    pub fn take_persist(&mut self, now_ms: u64) -> Option<ClockRecord> {
        if !self.dirty {
            return None;
        }
        if let Some(last) = self.last_persist_ms
            && now_ms.saturating_sub(last) < self.config.persist_interval_ms
        {
            return None;
        }
        let record = self.record(now_ms)?;
        self.dirty = false;
        self.last_persist_ms = Some(now_ms);
        Some(record)
    }
}
