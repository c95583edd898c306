//! Voice-session state: recording, waiting for the peer, showing its answer.

use heapless::String;
use log::{debug, info, warn};

use crate::audio::{AUDIO_FRAME_BYTES, AudioCapture};
use crate::link::{Channel, ConnectivityManager, Radio};
use crate::protocol::{END, START_V};

pub const REPLY_BYTES: usize = 512;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UiState {
    Idle,
    Recording,
    Answer,
    WaitingTime,
    WaitingAnswer,
}

impl UiState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Answer => "answer",
            Self::WaitingTime => "waiting-time",
            Self::WaitingAnswer => "waiting-answer",
        }
    }

    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingTime | Self::WaitingAnswer)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    pub waiting_timeout_ms: u64,
    pub max_recording_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            waiting_timeout_ms: 30_000,
            max_recording_ms: 60_000,
        }
    }
}

impl SessionConfig {
    pub const fn with_waiting_timeout_ms(mut self, value: u64) -> Self {
        self.waiting_timeout_ms = value;
        self
    }

    pub const fn with_max_recording_ms(mut self, value: u64) -> Self {
        self.max_recording_ms = value;
        self
    }
}

/// What one recording pump did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordingPump {
    Idle,
    Streaming,
    /// Hit the duration cap; the recording was stopped normally.
    Stopped,
}

pub struct Session {
    config: SessionConfig,
    ui: UiState,
    recording_since_ms: Option<u64>,
    waiting_since_ms: Option<u64>,
    reply: String<REPLY_BYTES>,
    frames_sent: u32,
    redraw: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            ui: UiState::Idle,
            recording_since_ms: None,
            waiting_since_ms: None,
            reply: String::new(),
            frames_sent: 0,
            redraw: true,
        }
    }

    pub fn ui(&self) -> UiState {
        self.ui
    }

    pub fn is_recording(&self) -> bool {
        self.ui == UiState::Recording
    }

    pub fn reply(&self) -> &str {
        self.reply.as_str()
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    pub fn take_redraw(&mut self) -> bool {
        core::mem::take(&mut self.redraw)
    }

    /// Starts a recording. Requires a subscribed peer and a working
    /// microphone.
    pub fn start_recording<R: Radio, A: AudioCapture>(
        &mut self,
        link: &mut ConnectivityManager<R>,
        audio: &mut A,
        now_ms: u64,
    ) -> bool {
        if self.is_recording() || !link.can_send_control() {
            return false;
        }
        if let Err(err) = audio.start() {
            warn!("session: microphone start failed: {:?}", err);
            return false;
        }

        self.recording_since_ms = Some(now_ms);
        self.waiting_since_ms = None;
        self.frames_sent = 0;
        self.set_ui(UiState::Recording);

        if let Err(err) = link.send_with_retry(Channel::Control, START_V, now_ms) {
            warn!("session: START_V not delivered: {:?}", err);
        }
        let _ = link.request_transfer_mode(true, now_ms);
        true
    }

    /// Ends a recording and waits for the answer when the peer can hear us.
    pub fn stop_recording<R: Radio, A: AudioCapture>(
        &mut self,
        link: &mut ConnectivityManager<R>,
        audio: &mut A,
        now_ms: u64,
    ) {
        if !self.is_recording() {
            return;
        }
        audio.stop();
        self.recording_since_ms = None;
        info!("session: recording stopped frames={}", self.frames_sent);

        if link.can_send_control() {
            self.waiting_since_ms = Some(now_ms);
            self.set_ui(UiState::WaitingAnswer);
            if let Err(err) = link.send_with_retry(Channel::Control, END, now_ms) {
                warn!("session: END not delivered: {:?}", err);
            }
        } else {
            self.waiting_since_ms = None;
            self.set_ui(UiState::Idle);
        }
        let _ = link.request_transfer_mode(false, now_ms);
    }

    /// Tap handler for the idle and recording screens.
    pub fn toggle_recording<R: Radio, A: AudioCapture>(
        &mut self,
        link: &mut ConnectivityManager<R>,
        audio: &mut A,
        now_ms: u64,
    ) -> bool {
        match self.ui {
            UiState::Recording => {
                self.stop_recording(link, audio, now_ms);
                true
            }
            UiState::Idle => self.start_recording(link, audio, now_ms),
            _ => false,
        }
    }

    /// Forwards at most one encoded frame and enforces the duration cap.
    pub fn pump_recording<R: Radio, A: AudioCapture>(
        &mut self,
        link: &mut ConnectivityManager<R>,
        audio: &mut A,
        now_ms: u64,
    ) -> RecordingPump {
        let Some(since) = self.recording_since_ms else {
            return RecordingPump::Idle;
        };

        if now_ms.saturating_sub(since) > self.config.max_recording_ms {
            info!("session: max recording duration reached");
            self.stop_recording(link, audio, now_ms);
            return RecordingPump::Stopped;
        }

        let mut frame = [0u8; AUDIO_FRAME_BYTES];
        if let Some(len) = audio.next_frame(&mut frame) {
            let len = len.min(AUDIO_FRAME_BYTES);
            match link.send_with_retry(Channel::Control, &frame[..len], now_ms) {
                Ok(()) => self.frames_sent = self.frames_sent.saturating_add(1),
                Err(err) => debug!("session: audio frame dropped: {:?}", err),
            }
        }
        RecordingPump::Streaming
    }

    /// Returns true when a waiting screen gave up; the caller marks activity.
    pub fn check_waiting_timeout(&mut self, now_ms: u64) -> bool {
        if !self.ui.is_waiting() {
            return false;
        }
        let Some(since) = self.waiting_since_ms else {
            self.waiting_since_ms = Some(now_ms);
            return false;
        };
        if now_ms.saturating_sub(since) < self.config.waiting_timeout_ms {
            return false;
        }
        info!("session: gave up on {}", self.ui.as_str());
        self.waiting_since_ms = None;
        self.set_ui(UiState::Idle);
        true
    }

    /// Shows the waiting-for-time screen when the clock is still unset.
    pub fn wait_for_time(&mut self, now_ms: u64) {
        if self.ui == UiState::Idle {
            self.waiting_since_ms = Some(now_ms);
            self.set_ui(UiState::WaitingTime);
        }
    }

    /// Clock became valid. Leaves the waiting-for-time screen.
    pub fn on_time_synced(&mut self) {
        if self.ui == UiState::WaitingTime {
            self.waiting_since_ms = None;
            self.set_ui(UiState::Idle);
        }
    }

    /// Stores a peer answer and shows it. Overlong text is cut at a
    /// character boundary.
    pub fn on_reply(&mut self, text: &str) {
        self.reply.clear();
        let mut end = text.len().min(REPLY_BYTES);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let _ = self.reply.push_str(&text[..end]);
        self.waiting_since_ms = None;
        info!("session: reply of {} bytes", text.len());
        self.set_ui(UiState::Answer);
    }

    /// Peer went away: the recording ends without `END`.
    pub fn on_disconnect<A: AudioCapture>(&mut self, audio: &mut A) {
        if self.recording_since_ms.take().is_some() {
            audio.stop();
            info!("session: recording aborted by disconnect");
        }
        self.waiting_since_ms = None;
        self.set_ui(UiState::Idle);
    }

    /// Wake from light sleep lands on the home screen.
    pub fn go_home(&mut self) {
        if self.is_recording() {
            return;
        }
        self.waiting_since_ms = None;
        self.set_ui(UiState::Idle);
        self.redraw = true;
    }

    fn set_ui(&mut self, next: UiState) {
        if self.ui != next {
            debug!("session: {} -> {}", self.ui.as_str(), next.as_str());
            self.ui = next;
        }
        self.redraw = true;
    }
}
