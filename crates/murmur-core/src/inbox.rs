//! Hand-off from radio callbacks to the main loop.
//!
//! The host task only pushes; the scheduler drains once per iteration. Text
//! writes arrive in fragments and are held back until no new fragment has
//! arrived for the coalescing window.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use heapless::{Deque, Vec};
use log::warn;

use crate::link::PeerAddress;

/// Largest single write on the OTA characteristic (ATT MTU 247 minus header).
pub const OTA_WRITE_BYTES: usize = 244;
pub const TEXT_BYTES: usize = 512;
pub const INBOX_DEPTH: usize = 12;
pub const TEXT_COALESCE_MS: u64 = 120;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    Connected { peer: PeerAddress, handle: u16 },
    Disconnected,
    /// Control-channel notifications were enabled or disabled by the peer.
    Subscribed(bool),
    OtaWrite(Vec<u8, OTA_WRITE_BYTES>),
    FileRequest,
    /// A complete text message, released after the coalescing window.
    Text(Vec<u8, TEXT_BYTES>),
}

impl LinkEvent {
    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connected { .. } | Self::Disconnected | Self::Subscribed(_)
        )
    }
}

struct InboxState<const N: usize> {
    events: Deque<LinkEvent, N>,
    text: Vec<u8, TEXT_BYTES>,
    text_ready_ms: Option<u64>,
    overflows: u32,
}

pub struct LinkInbox<const N: usize = INBOX_DEPTH> {
    state: Mutex<CriticalSectionRawMutex, RefCell<InboxState<N>>>,
}

impl<const N: usize> Default for LinkInbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LinkInbox<N> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(InboxState {
                events: Deque::new(),
                text: Vec::new(),
                text_ready_ms: None,
                overflows: 0,
            })),
        }
    }

    /// Queues an event without blocking. Connection lifecycle events evict
    /// the oldest entry when full; anything else is dropped and counted.
    pub fn push(&self, event: LinkEvent) -> bool {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.events.is_full() {
                state.overflows = state.overflows.saturating_add(1);
                if !event.is_lifecycle() {
                    warn!("inbox: full; dropping event");
                    return false;
                }
                warn!("inbox: full; evicting oldest event");
                let _ = state.events.pop_front();
            }
            state.events.push_back(event).is_ok()
        })
    }

    pub fn push_ota(&self, data: &[u8]) -> bool {
        match Vec::from_slice(data) {
            Ok(payload) => self.push(LinkEvent::OtaWrite(payload)),
            Err(()) => {
                warn!("inbox: ota write of {} bytes too large", data.len());
                self.note_overflow();
                false
            }
        }
    }

    /// Appends a text fragment and restarts the coalescing window.
    pub fn push_text(&self, fragment: &[u8], now_ms: u64) -> bool {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.text.extend_from_slice(fragment).is_err() {
                warn!("inbox: text buffer full; fragment dropped");
                state.overflows = state.overflows.saturating_add(1);
                return false;
            }
            state.text_ready_ms = Some(now_ms.saturating_add(TEXT_COALESCE_MS));
            true
        })
    }

    /// Next queued event, or the coalesced text once its window has closed.
    pub fn pop(&self, now_ms: u64) -> Option<LinkEvent> {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }

            match state.text_ready_ms {
                Some(ready) if now_ms >= ready => {
                    state.text_ready_ms = None;
                    let text = core::mem::take(&mut state.text);
                    Some(LinkEvent::Text(text))
                }
                _ => None,
            }
        })
    }

    /// True while text is buffered but not yet released.
    pub fn text_pending(&self) -> bool {
        self.state
            .lock(|cell| cell.borrow().text_ready_ms.is_some())
    }

    /// Number of drops since the last call.
    pub fn take_overflows(&self) -> u32 {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            core::mem::take(&mut state.overflows)
        })
    }

    fn note_overflow(&self) {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            state.overflows = state.overflows.saturating_add(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: PeerAddress = PeerAddress([9, 8, 7, 6, 5, 4]);

    #[test]
    fn events_drain_in_order() {
        let inbox: LinkInbox<4> = LinkInbox::new();
        assert!(inbox.push(LinkEvent::Connected { peer: PEER, handle: 1 }));
        assert!(inbox.push(LinkEvent::Subscribed(true)));
        assert!(inbox.push(LinkEvent::FileRequest));

        assert_eq!(
            inbox.pop(0),
            Some(LinkEvent::Connected { peer: PEER, handle: 1 })
        );
        assert_eq!(inbox.pop(0), Some(LinkEvent::Subscribed(true)));
        assert_eq!(inbox.pop(0), Some(LinkEvent::FileRequest));
        assert_eq!(inbox.pop(0), None);
    }

    #[test]
    fn text_fragments_coalesce_until_quiet() {
        let inbox: LinkInbox<4> = LinkInbox::new();
        assert!(inbox.push_text(b"Hello, ", 1_000));
        assert!(inbox.push_text(b"world", 1_080));

        assert_eq!(inbox.pop(1_150), None);
        assert!(inbox.text_pending());

        let Some(LinkEvent::Text(text)) = inbox.pop(1_200) else {
            panic!("expected coalesced text");
        };
        assert_eq!(text.as_slice(), b"Hello, world");
        assert!(!inbox.text_pending());
        assert_eq!(inbox.pop(5_000), None);
    }

    #[test]
    fn queued_events_go_before_ready_text() {
        let inbox: LinkInbox<4> = LinkInbox::new();
        assert!(inbox.push_text(b"hi", 0));
        assert!(inbox.push(LinkEvent::Disconnected));

        assert_eq!(inbox.pop(500), Some(LinkEvent::Disconnected));
        assert!(matches!(inbox.pop(500), Some(LinkEvent::Text(_))));
    }

    #[test]
    fn full_queue_drops_data_but_keeps_lifecycle() {
        let inbox: LinkInbox<2> = LinkInbox::new();
        assert!(inbox.push_ota(b"a"));
        assert!(inbox.push_ota(b"b"));

        assert!(!inbox.push_ota(b"c"));
        assert!(inbox.push(LinkEvent::Disconnected));
        assert_eq!(inbox.take_overflows(), 2);
        assert_eq!(inbox.take_overflows(), 0);

        let first = inbox.pop(0);
        assert!(matches!(first, Some(LinkEvent::OtaWrite(ref data)) if data.as_slice() == b"b"));
        assert_eq!(inbox.pop(0), Some(LinkEvent::Disconnected));
    }

    #[test]
    fn oversized_writes_are_counted() {
        let inbox: LinkInbox<2> = LinkInbox::new();
        assert!(!inbox.push_ota(&[0u8; OTA_WRITE_BYTES + 1]));
        assert!(!inbox.push_text(&[b'x'; TEXT_BYTES + 1], 0));
        assert_eq!(inbox.take_overflows(), 2);
        assert_eq!(inbox.pop(1_000), None);
    }
}
