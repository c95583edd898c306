//! Streams the last encoded recording on the file channel: a 4-byte
//! little-endian length, then fixed-size frames, one per scheduler pass.

use log::{debug, info};

use crate::audio::AudioCapture;
use crate::link::{Channel, ConnectivityManager, Radio};

pub const FILE_FRAME_BYTES: usize = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilePump {
    Idle,
    Sent,
    Done,
    Aborted,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileStream {
    total: u32,
    offset: u32,
    header_sent: bool,
    active: bool,
}

impl FileStream {
    pub const fn new() -> Self {
        Self {
            total: 0,
            offset: 0,
            header_sent: false,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn progress(&self) -> (u32, u32) {
        (self.offset, self.total)
    }

    /// Starts streaming if a recording exists. Restarts a running stream.
    pub fn request<A: AudioCapture>(&mut self, audio: &A) -> bool {
        let total = audio.recorded_len();
        if total == 0 {
            debug!("file: request ignored; nothing recorded");
            return false;
        }
        info!("file: streaming {} bytes", total);
        *self = Self {
            total,
            offset: 0,
            header_sent: false,
            active: true,
        };
        true
    }

    pub fn cancel(&mut self) {
        if self.active {
            debug!("file: stream cancelled at {}/{}", self.offset, self.total);
        }
        self.active = false;
    }

    /// Sends the header or the next frame.
    pub fn pump<R: Radio, A: AudioCapture>(
        &mut self,
        link: &mut ConnectivityManager<R>,
        audio: &A,
        now_ms: u64,
    ) -> FilePump {
        if !self.active {
            return FilePump::Idle;
        }

        if !self.header_sent {
            let header = self.total.to_le_bytes();
            if let Err(err) = link.send_with_retry(Channel::File, &header, now_ms) {
                debug!("file: header not sent: {:?}", err);
                self.active = false;
                return FilePump::Aborted;
            }
            self.header_sent = true;
            return FilePump::Sent;
        }

        let mut frame = [0u8; FILE_FRAME_BYTES];
        let want = ((self.total - self.offset) as usize).min(FILE_FRAME_BYTES);
        let len = audio.read_recorded(self.offset, &mut frame[..want]);
        if len == 0 {
            debug!("file: recording shrank at {}/{}", self.offset, self.total);
            self.active = false;
            return FilePump::Aborted;
        }

        if let Err(err) = link.send_with_retry(Channel::File, &frame[..len], now_ms) {
            debug!("file: frame not sent: {:?}", err);
            self.active = false;
            return FilePump::Aborted;
        }

        self.offset += len as u32;
        if self.offset >= self.total {
            info!("file: stream complete");
            self.active = false;
            return FilePump::Done;
        }
        FilePump::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkConfig, PeerAddress};
    use crate::mock::{MockAudio, MockRadio};

    fn link() -> ConnectivityManager<MockRadio> {
        let mut link = ConnectivityManager::new(
            MockRadio {
                connected: true,
                ..MockRadio::default()
            },
            LinkConfig::default(),
        );
        link.on_connect(PeerAddress([0; 6]), 1, 0);
        link
    }

    #[test]
    fn header_then_fixed_frames() {
        let mut link = link();
        let audio = MockAudio {
            recorded: (0..300u32).map(|i| i as u8).collect(),
            ..MockAudio::default()
        };
        let mut stream = FileStream::new();
        assert!(stream.request(&audio));

        let mut results = std::vec::Vec::new();
        for now in 0..10 {
            results.push(stream.pump(&mut link, &audio, now));
        }

        assert_eq!(
            &results[..5],
            &[
                FilePump::Sent,
                FilePump::Sent,
                FilePump::Sent,
                FilePump::Done,
                FilePump::Idle
            ]
        );
        let sent = link.radio().sent_on(Channel::File);
        assert_eq!(sent[0], &300u32.to_le_bytes()[..]);
        assert_eq!(sent[1].len(), 128);
        assert_eq!(sent[2].len(), 128);
        assert_eq!(sent[3].len(), 44);
        assert_eq!(sent[3][43], (299u32 % 256) as u8);
    }

    #[test]
    fn nothing_recorded_means_no_stream() {
        let audio = MockAudio::default();
        let mut stream = FileStream::new();
        assert!(!stream.request(&audio));
        assert!(!stream.is_active());
    }

    #[test]
    fn lost_link_aborts_the_stream() {
        let mut link = ConnectivityManager::new(MockRadio::default(), LinkConfig::default());
        let audio = MockAudio {
            recorded: vec![1, 2, 3],
            ..MockAudio::default()
        };
        let mut stream = FileStream::new();
        assert!(stream.request(&audio));
        assert_eq!(stream.pump(&mut link, &audio, 0), FilePump::Aborted);
        assert!(!stream.is_active());
    }
}
