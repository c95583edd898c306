//! Audio capture boundary. The microphone pipeline and its encoder live
//! behind this trait.

use core::fmt::Debug;

use heapless::Vec;
use log::{info, warn};

/// Encoded audio frames as the capture pipeline produces them.
pub const AUDIO_FRAME_BYTES: usize = 128;

/// Upper bound on a retained recording.
pub const MAX_RECORDING_BYTES: usize = 120_000;

pub trait AudioCapture {
    type Error: Debug;

    fn start(&mut self) -> Result<(), Self::Error>;
    fn stop(&mut self);
    /// Frees the capture peripheral entirely.
    fn release(&mut self);
    /// Copies the next encoded frame into `out`, returning its length.
    fn next_frame(&mut self, out: &mut [u8; AUDIO_FRAME_BYTES]) -> Option<usize>;
    /// Length in bytes of the last complete encoded recording.
    fn recorded_len(&self) -> u32;
    /// Reads part of the last recording starting at `offset`.
    fn read_recorded(&self, offset: u32, out: &mut [u8]) -> usize;
}

impl<T: AudioCapture + ?Sized> AudioCapture for &mut T {
    type Error = T::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        T::start(self)
    }

    fn stop(&mut self) {
        T::stop(self)
    }

    fn release(&mut self) {
        T::release(self)
    }

    fn next_frame(&mut self, out: &mut [u8; AUDIO_FRAME_BYTES]) -> Option<usize> {
        T::next_frame(self, out)
    }

    fn recorded_len(&self) -> u32 {
        T::recorded_len(self)
    }

    fn read_recorded(&self, offset: u32, out: &mut [u8]) -> usize {
        T::read_recorded(self, offset, out)
    }
}

/// Non-blocking producer of sample bytes, typically fed by a DMA task.
pub trait SampleSource {
    type Error: Debug;

    fn start(&mut self) -> Result<(), Self::Error>;
    fn stop(&mut self);
    fn release(&mut self);
    /// Copies whatever is buffered into `out`. Zero means nothing yet.
    fn read(&mut self, out: &mut [u8]) -> usize;
}

/// Frames a [`SampleSource`] and keeps a copy of the last recording for the
/// file service.
pub struct ClipRecorder<S, const N: usize> {
    source: S,
    clip: Vec<u8, N>,
    running: bool,
    truncated: bool,
}

impl<S: SampleSource, const N: usize> ClipRecorder<S, N> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            clip: Vec::new(),
            running: false,
            truncated: false,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The retained clip hit its capacity and later frames were not kept.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn retain(&mut self, frame: &[u8]) {
        if self.truncated {
            return;
        }
        let room = N - self.clip.len();
        let take = frame.len().min(room);
        let _ = self.clip.extend_from_slice(&frame[..take]);
        if take < frame.len() {
            self.truncated = true;
            warn!("audio: clip full at {} bytes; streaming continues", N);
        }
    }
}

impl<S: SampleSource, const N: usize> AudioCapture for ClipRecorder<S, N> {
    type Error = S::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.source.start()?;
        self.clip.clear();
        self.truncated = false;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.source.stop();
        self.running = false;
        info!(
            "audio: recording closed bytes={} truncated={}",
            self.clip.len(),
            self.truncated
        );
    }

    fn release(&mut self) {
        self.stop();
        self.source.release();
    }

    fn next_frame(&mut self, out: &mut [u8; AUDIO_FRAME_BYTES]) -> Option<usize> {
        if !self.running {
            return None;
        }
        let len = self.source.read(out);
        if len == 0 {
            return None;
        }
        self.retain(&out[..len]);
        Some(len)
    }

    fn recorded_len(&self) -> u32 {
        if self.running {
            0
        } else {
            self.clip.len() as u32
        }
    }

    fn read_recorded(&self, offset: u32, out: &mut [u8]) -> usize {
        if self.running {
            return 0;
        }
        let start = (offset as usize).min(self.clip.len());
        let len = out.len().min(self.clip.len() - start);
        out[..len].copy_from_slice(&self.clip[start..start + len]);
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedSource {
        chunks: VecDeque<std::vec::Vec<u8>>,
        starts: u32,
        stops: u32,
        released: bool,
        fail_start: bool,
    }

    impl SampleSource for ScriptedSource {
        type Error = &'static str;

        fn start(&mut self) -> Result<(), Self::Error> {
            if self.fail_start {
                return Err("busy");
            }
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
        }

        fn release(&mut self) {
            self.released = true;
        }

        fn read(&mut self, out: &mut [u8]) -> usize {
            let Some(chunk) = self.chunks.pop_front() else {
                return 0;
            };
            let len = chunk.len().min(out.len());
            out[..len].copy_from_slice(&chunk[..len]);
            len
        }
    }

    fn recorder(chunks: &[&[u8]]) -> ClipRecorder<ScriptedSource, 256> {
        let source = ScriptedSource {
            chunks: chunks.iter().map(|chunk| chunk.to_vec()).collect(),
            ..ScriptedSource::default()
        };
        ClipRecorder::new(source)
    }

    #[test]
    fn frames_are_retained_until_the_next_start() {
        let mut rec = recorder(&[&[1; 128], &[2; 40]]);
        let mut frame = [0u8; AUDIO_FRAME_BYTES];

        rec.start().unwrap();
        assert_eq!(rec.next_frame(&mut frame), Some(128));
        assert_eq!(rec.next_frame(&mut frame), Some(40));
        assert_eq!(rec.next_frame(&mut frame), None);
        assert_eq!(rec.recorded_len(), 0);
        rec.stop();

        assert_eq!(rec.recorded_len(), 168);
        let mut tail = [0u8; 64];
        assert_eq!(rec.read_recorded(128, &mut tail), 40);
        assert!(tail[..40].iter().all(|b| *b == 2));

        rec.start().unwrap();
        rec.stop();
        assert_eq!(rec.recorded_len(), 0);
        assert_eq!(rec.source().starts, 2);
        assert_eq!(rec.source().stops, 2);
    }

    #[test]
    fn nothing_is_read_while_stopped() {
        let mut rec = recorder(&[&[9; 10]]);
        let mut frame = [0u8; AUDIO_FRAME_BYTES];
        assert_eq!(rec.next_frame(&mut frame), None);
        rec.stop();
        assert_eq!(rec.source().stops, 0);
    }

    #[test]
    fn clip_is_truncated_but_frames_keep_flowing() {
        let mut rec = recorder(&[&[1; 128], &[2; 128], &[3; 128]]);
        let mut frame = [0u8; AUDIO_FRAME_BYTES];

        rec.start().unwrap();
        for _ in 0..3 {
            assert_eq!(rec.next_frame(&mut frame), Some(128));
        }
        rec.stop();

        assert!(rec.truncated());
        assert_eq!(rec.recorded_len(), 256);
    }

    #[test]
    fn failed_start_keeps_the_previous_clip() {
        let mut rec = recorder(&[&[5; 16]]);
        let mut frame = [0u8; AUDIO_FRAME_BYTES];
        rec.start().unwrap();
        let _ = rec.next_frame(&mut frame);
        rec.stop();

        rec.source.fail_start = true;
        assert_eq!(rec.start(), Err("busy"));
        assert!(!rec.is_running());
        assert_eq!(rec.recorded_len(), 16);
    }

    #[test]
    fn release_stops_first() {
        let mut rec = recorder(&[]);
        rec.start().unwrap();
        rec.release();
        assert!(!rec.is_running());
        assert_eq!(rec.source().stops, 1);
        assert!(rec.source().released);
    }
}
