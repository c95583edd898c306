//! Chunked firmware-image transfer over the OTA write/notify channel.
//!
//! Text commands (`BEGIN:`, `ABORT`) and raw image bytes share one
//! characteristic. Every call returns the status lines to notify back; the
//! caller owns delivery.

use core::fmt::{Debug, Write as _};

use heapless::{String, Vec};
use log::{info, warn};
use md5::{Digest, Md5};

pub const OTA_STATUS_BYTES: usize = 20;
pub const OTA_MAX_STATUSES: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OtaConfig {
    pub chunk_timeout_ms: u64,
    pub progress_interval_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_ms: 10_000,
            progress_interval_ms: 750,
            restart_delay_ms: 800,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtaState {
    Idle,
    Receiving,
    /// Image verified; waiting out the restart delay.
    Finalizing,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtaError {
    Size,
    Busy,
    Begin,
    Write,
    SizeMismatch,
    Timeout,
    Abort,
    End,
}

impl OtaError {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Size => "SIZE",
            Self::Busy => "BUSY",
            Self::Begin => "BEGIN",
            Self::Write => "WRITE",
            Self::SizeMismatch => "SIZE_MISMATCH",
            Self::Timeout => "TIMEOUT",
            Self::Abort => "ABORT",
            Self::End => "END",
        }
    }
}

/// Status line sent back to the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtaStatus {
    AckBegin,
    Progress(u8),
    Ok,
    Error(OtaError),
}

impl OtaStatus {
    pub fn encode(self) -> String<OTA_STATUS_BYTES> {
        let mut out = String::new();
        let _ = match self {
            Self::AckBegin => out.push_str("ACK:BEGIN").map_err(|_| core::fmt::Error),
            Self::Progress(pct) => write!(out, "PROG:{}", pct),
            Self::Ok => out.push_str("OTA_OK").map_err(|_| core::fmt::Error),
            Self::Error(err) => write!(out, "ERR:{}", err.code()),
        };
        out
    }
}

/// Destination for the incoming image, typically the inactive app slot.
pub trait FirmwareSink {
    type Error: Debug;

    /// Erases or otherwise prepares room for `size` bytes.
    fn begin(&mut self, size: u32) -> Result<(), Self::Error>;
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;
    /// Validates the image and marks it bootable.
    fn finish(&mut self) -> Result<(), Self::Error>;
    /// Discards whatever was written so far.
    fn abort(&mut self);
}

/// Live transfer bookkeeping.
pub struct OtaTransfer {
    pub expected_size: u32,
    pub received_size: u32,
    pub last_chunk_ms: u64,
    pub checksum: Option<[u8; 16]>,
    hasher: Md5,
    last_progress_ms: Option<u64>,
}

impl OtaTransfer {
    fn new(expected_size: u32, checksum: Option<[u8; 16]>, now_ms: u64) -> Self {
        Self {
            expected_size,
            received_size: 0,
            last_chunk_ms: now_ms,
            checksum,
            hasher: Md5::new(),
            last_progress_ms: None,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.expected_size == 0 {
            return 0;
        }
        ((u64::from(self.received_size) * 100) / u64::from(self.expected_size)) as u8
    }
}

/// Result of feeding one write or one tick into the machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OtaOutcome {
    pub statuses: Vec<OtaStatus, OTA_MAX_STATUSES>,
    /// The write should count as user activity.
    pub activity: bool,
    /// A transfer was just accepted.
    pub began: bool,
    /// The restart delay has elapsed.
    pub restart_due: bool,
}

impl OtaOutcome {
    fn push(&mut self, status: OtaStatus) {
        let _ = self.statuses.push(status);
    }
}

pub struct OtaTransferMachine<S: FirmwareSink> {
    sink: S,
    config: OtaConfig,
    transfer: Option<OtaTransfer>,
    restart_at_ms: Option<u64>,
}

impl<S: FirmwareSink> OtaTransferMachine<S> {
    pub fn new(sink: S, config: OtaConfig) -> Self {
        Self {
            sink,
            config,
            transfer: None,
            restart_at_ms: None,
        }
    }

    pub fn state(&self) -> OtaState {
        if self.restart_at_ms.is_some() {
            OtaState::Finalizing
        } else if self.transfer.is_some() {
            OtaState::Receiving
        } else {
            OtaState::Idle
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn transfer(&self) -> Option<&OtaTransfer> {
        self.transfer.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Dispatches one peer write on the OTA channel.
    pub fn handle_write(&mut self, data: &[u8], now_ms: u64) -> OtaOutcome {
        let mut outcome = OtaOutcome::default();
        if data.is_empty() {
            return outcome;
        }

        if let Some(meta) = data.strip_prefix(b"BEGIN:") {
            if self.state() != OtaState::Idle {
                outcome.push(OtaStatus::Error(OtaError::Busy));
            } else {
                self.begin(meta, now_ms, &mut outcome);
            }
            return outcome;
        }

        if data == b"ABORT" {
            info!("ota: abort requested");
            self.reset(Some(OtaError::Abort), &mut outcome);
            return outcome;
        }

        if self.transfer.is_some() {
            self.write_chunk(data, now_ms, &mut outcome);
        }
        outcome
    }

    /// Chunk-timeout and restart evaluation. Runs every iteration whether or
    /// not a peer is connected.
    pub fn tick(&mut self, now_ms: u64) -> OtaOutcome {
        let mut outcome = OtaOutcome::default();

        if let Some(at) = self.restart_at_ms
            && now_ms >= at
        {
            outcome.restart_due = true;
            return outcome;
        }

        if let Some(transfer) = self.transfer.as_ref()
            && now_ms.saturating_sub(transfer.last_chunk_ms) >= self.config.chunk_timeout_ms
        {
            warn!(
                "ota: chunk timeout after {}/{} bytes",
                transfer.received_size, transfer.expected_size
            );
            self.reset(Some(OtaError::Timeout), &mut outcome);
        }
        outcome
    }

    /// Peer went away: drop any partial image without a status line.
    pub fn on_disconnect(&mut self) {
        if self.transfer.is_some() {
            info!("ota: peer disconnected mid-transfer; discarding image");
            let mut ignored = OtaOutcome::default();
            self.reset(None, &mut ignored);
        }
    }

    /// Inbound data was lost before it reached the machine.
    pub fn on_inbound_overflow(&mut self) -> OtaOutcome {
        let mut outcome = OtaOutcome::default();
        if self.transfer.is_some() {
            warn!("ota: inbound queue overflow; failing transfer");
            self.reset(Some(OtaError::Write), &mut outcome);
        }
        outcome
    }

    fn begin(&mut self, meta: &[u8], now_ms: u64, outcome: &mut OtaOutcome) {
        let Some((size, checksum)) = parse_begin(meta) else {
            outcome.push(OtaStatus::Error(OtaError::Size));
            return;
        };

        outcome.activity = true;
        self.sink.abort();
        if let Err(err) = self.sink.begin(size) {
            warn!("ota: sink begin failed size={} err={:?}", size, err);
            outcome.push(OtaStatus::Error(OtaError::Begin));
            return;
        }

        info!(
            "ota: begin size={} checksum={}",
            size,
            if checksum.is_some() { "md5" } else { "none" }
        );
        self.transfer = Some(OtaTransfer::new(size, checksum, now_ms));
        outcome.began = true;
        outcome.push(OtaStatus::AckBegin);
    }

    fn write_chunk(&mut self, data: &[u8], now_ms: u64, outcome: &mut OtaOutcome) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        let len = data.len() as u64;
        if u64::from(transfer.received_size) + len > u64::from(transfer.expected_size) {
            warn!(
                "ota: chunk overruns image ({} + {} > {})",
                transfer.received_size, len, transfer.expected_size
            );
            self.reset(Some(OtaError::SizeMismatch), outcome);
            return;
        }

        match self.sink.write(data) {
            Ok(written) if written == data.len() => {}
            Ok(written) => {
                warn!("ota: short write {}/{}", written, data.len());
                self.reset(Some(OtaError::Write), outcome);
                return;
            }
            Err(err) => {
                warn!("ota: write failed: {:?}", err);
                self.reset(Some(OtaError::Write), outcome);
                return;
            }
        }

        transfer.hasher.update(data);
        transfer.received_size += data.len() as u32;
        transfer.last_chunk_ms = now_ms;
        outcome.activity = true;

        if transfer
            .last_progress_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.config.progress_interval_ms)
        {
            transfer.last_progress_ms = Some(now_ms);
            outcome.push(OtaStatus::Progress(transfer.percent()));
        }

        if transfer.received_size == transfer.expected_size {
            self.finalize(now_ms, outcome);
        }
    }

    fn finalize(&mut self, now_ms: u64, outcome: &mut OtaOutcome) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };

        if let Some(expected) = transfer.checksum {
            let digest = transfer.hasher.finalize();
            if digest.as_slice() != expected.as_slice() {
                warn!("ota: md5 mismatch");
                self.sink.abort();
                outcome.push(OtaStatus::Error(OtaError::End));
                return;
            }
        }

        if let Err(err) = self.sink.finish() {
            warn!("ota: finish failed: {:?}", err);
            self.sink.abort();
            outcome.push(OtaStatus::Error(OtaError::End));
            return;
        }

        info!(
            "ota: image verified ({} bytes); restart in {}ms",
            transfer.expected_size, self.config.restart_delay_ms
        );
        outcome.push(OtaStatus::Ok);
        self.restart_at_ms = Some(now_ms.saturating_add(self.config.restart_delay_ms));
    }

    fn reset(&mut self, reason: Option<OtaError>, outcome: &mut OtaOutcome) {
        if let Some(err) = reason {
            outcome.push(OtaStatus::Error(err));
        }
        self.sink.abort();
        self.transfer = None;
        if self.restart_at_ms.take().is_some() {
            info!("ota: pending restart cancelled");
        }
    }
}

/// Parses `<size>[:<md5>]`. The size must be a nonzero decimal; a checksum
/// is kept only when it is exactly 32 hex digits once whitespace is removed.
fn parse_begin(meta: &[u8]) -> Option<(u32, Option<[u8; 16]>)> {
    let (size_part, md5_part) = match meta.iter().position(|b| *b == b':') {
        Some(idx) => (&meta[..idx], Some(&meta[idx + 1..])),
        None => (meta, None),
    };

    let size = parse_decimal(size_part)?;
    if size == 0 {
        return None;
    }

    Some((size, md5_part.and_then(parse_md5)))
}

fn parse_decimal(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u32, |acc, b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(u32::from(b - b'0'))
    })
}

fn parse_md5(raw: &[u8]) -> Option<[u8; 16]> {
    let mut nibbles: Vec<u8, 32> = Vec::new();
    for b in raw.iter().filter(|b| !b.is_ascii_whitespace()) {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        nibbles.push(nibble).ok()?;
    }
    if nibbles.len() != 32 {
        return None;
    }

    let mut out = [0u8; 16];
    for (slot, pair) in out.iter_mut().zip(nibbles.chunks_exact(2)) {
        *slot = (pair[0] << 4) | pair[1];
    }
    Some(out)
}
