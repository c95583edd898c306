//! Microphone hand-off between the DMA capture task and the main loop.
//!
//! The capture task waits for [`MicControl::wait_for_start`], streams DMA
//! bytes into the pipe with [`MicControl::feed`] while running, and tears the
//! transfer down when the main loop stops the recording.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, pipe::Pipe, signal::Signal};
use log::{debug, info};
use murmur_core::audio::SampleSource;

/// PCM sample rate of the capture path.
pub const MIC_SAMPLE_RATE_HZ: u32 = 16_000;
/// About 128 ms of 16-bit mono audio.
pub const MIC_PIPE_BYTES: usize = 4096;

pub struct MicControl {
    pipe: Pipe<CriticalSectionRawMutex, MIC_PIPE_BYTES>,
    running: AtomicBool,
    released: AtomicBool,
    dropped: AtomicU32,
    start: Signal<CriticalSectionRawMutex, ()>,
}

impl MicControl {
    pub const fn new() -> Self {
        Self {
            pipe: Pipe::new(),
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
            start: Signal::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns once a recording opens or the microphone is released.
    pub async fn wait_for_start(&self) {
        while !self.is_running() && !self.is_released() {
            self.start.wait().await;
        }
    }

    /// Pushes captured bytes without blocking. Bytes that do not fit are
    /// dropped and counted.
    pub fn feed(&self, bytes: &[u8]) -> usize {
        let written = self.pipe.try_write(bytes).unwrap_or(0);
        if written < bytes.len() {
            self.dropped
                .fetch_add((bytes.len() - written) as u32, Ordering::Relaxed);
        }
        written
    }

    /// Bytes dropped since the last call.
    pub fn take_dropped(&self) -> u32 {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}

impl Default for MicControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MicError {
    Released,
}

/// Main-loop side of the capture path.
pub struct MicSource {
    control: &'static MicControl,
}

impl MicSource {
    pub const fn new(control: &'static MicControl) -> Self {
        Self { control }
    }
}

impl SampleSource for MicSource {
    type Error = MicError;

    fn start(&mut self) -> Result<(), Self::Error> {
        if self.control.is_released() {
            return Err(MicError::Released);
        }
        self.control.pipe.clear();
        let _ = self.control.take_dropped();
        self.control.running.store(true, Ordering::Release);
        self.control.start.signal(());
        info!("mic: capture start rate={}Hz", MIC_SAMPLE_RATE_HZ);
        Ok(())
    }

    fn stop(&mut self) {
        self.control.running.store(false, Ordering::Release);
        let dropped = self.control.take_dropped();
        if dropped > 0 {
            debug!("mic: capture stop dropped_bytes={}", dropped);
        }
    }

    fn release(&mut self) {
        self.control.running.store(false, Ordering::Release);
        self.control.released.store(true, Ordering::Release);
        self.control.start.signal(());
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        self.control.pipe.try_read(out).unwrap_or(0)
    }
}
