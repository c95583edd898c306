//! BLE link state shared between the host task and the main loop, plus the
//! command queue the main loop uses to drive the host task.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::Channel as CommandChannel,
};
use heapless::Vec;
use log::debug;
use murmur_core::link::{AdvertisingProfile, Channel, ConnParams, Radio};

/// Largest notification payload at the negotiated MTU.
pub const NOTIFY_BYTES: usize = 244;
pub const COMMAND_DEPTH: usize = 16;

pub type RadioCommands = CommandChannel<CriticalSectionRawMutex, RadioCommand, COMMAND_DEPTH>;

/// Work the host task performs on behalf of the main loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RadioCommand {
    Advertise(AdvertisingProfile),
    UpdateParams { handle: u16, params: ConnParams },
    Notify {
        channel: Channel,
        payload: Vec<u8, NOTIFY_BYTES>,
    },
    /// Drop the connection and stop advertising ahead of deep sleep.
    Teardown,
}

/// High-level radio state for logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Advertising = 1,
    Connected = 2,
    TornDown = 3,
}

/// Lock-free shared link state.
#[derive(Debug)]
pub struct LinkStatusHandle {
    state: AtomicU8,
}

impl LinkStatusHandle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Idle as u8),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == LinkState::Connected as u8
    }

    pub fn mark_advertising(&self) {
        self.update_state(LinkState::Advertising);
    }

    pub fn mark_connected(&self) {
        self.update_state(LinkState::Connected);
    }

    pub fn mark_disconnected(&self) {
        self.update_state(LinkState::Idle);
    }

    pub fn mark_torn_down(&self) {
        self.update_state(LinkState::TornDown);
    }

    fn update_state(&self, next: LinkState) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            debug!("radio: state={:?}", next);
        }
    }
}

impl Default for LinkStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues a teardown even when the queue is full of stale traffic.
pub fn request_teardown(commands: &RadioCommands, status: &LinkStatusHandle) {
    commands.clear();
    let _ = commands.try_send(RadioCommand::Teardown);
    status.mark_torn_down();
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RadioError {
    QueueFull,
    PayloadTooLarge,
    NotConnected,
}

/// [`Radio`] that forwards every request to the host task.
///
/// The host task owns notification retries and their backoff, so a send
/// only ever fails here on a full queue or a missing peer.
pub struct BleRadio {
    commands: &'static RadioCommands,
    status: &'static LinkStatusHandle,
}

impl BleRadio {
    pub const fn new(commands: &'static RadioCommands, status: &'static LinkStatusHandle) -> Self {
        Self { commands, status }
    }

    fn send(&mut self, command: RadioCommand) -> Result<(), RadioError> {
        self.commands.try_send(command).map_err(|_| {
            debug!("radio: command queue full");
            RadioError::QueueFull
        })
    }
}

impl Radio for BleRadio {
    type Error = RadioError;

    fn start_advertising(&mut self, profile: AdvertisingProfile) -> Result<(), Self::Error> {
        self.send(RadioCommand::Advertise(profile))
    }

    fn update_conn_params(&mut self, handle: u16, params: ConnParams) -> Result<(), Self::Error> {
        self.send(RadioCommand::UpdateParams { handle, params })
    }

    fn notify(&mut self, channel: Channel, payload: &[u8]) -> Result<(), Self::Error> {
        if !self.status.is_connected() {
            return Err(RadioError::NotConnected);
        }
        let payload = Vec::from_slice(payload).map_err(|()| RadioError::PayloadTooLarge)?;
        self.send(RadioCommand::Notify { channel, payload })
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// No-op: the host task shares this executor task, so blocking here
    /// would stall the queue drain the retry waits for.
    fn delay_ms(&mut self, _ms: u32) {}
}
