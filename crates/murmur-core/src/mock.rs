//! Host-side stand-ins for every hardware trait, shared by the scheduler
//! tests.

use std::collections::VecDeque;

use crate::audio::{AUDIO_FRAME_BYTES, AudioCapture};
use crate::clock::{ClockRecord, ClockStore};
use crate::link::{AdvertisingProfile, Channel, ConnParams, Radio};
use crate::ota::FirmwareSink;
use crate::power::{ArmError, CpuCeiling, Halt, PowerBoard, ShutdownSequence};
use crate::touch::{TouchPanel, TouchPoint};

#[derive(Default)]
pub struct MockRadio {
    pub connected: bool,
    pub advertised: Vec<AdvertisingProfile>,
    pub params: Vec<ConnParams>,
    pub sent: Vec<(Channel, Vec<u8>)>,
    pub fail_notify: bool,
}

impl MockRadio {
    pub fn sent_on(&self, channel: Channel) -> Vec<&[u8]> {
        self.sent
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, payload)| payload.as_slice())
            .collect()
    }

    pub fn sent_text(&self, channel: Channel) -> Vec<String> {
        self.sent_on(channel)
            .into_iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

impl Radio for MockRadio {
    type Error = ();

    fn start_advertising(&mut self, profile: AdvertisingProfile) -> Result<(), Self::Error> {
        self.advertised.push(profile);
        Ok(())
    }

    fn update_conn_params(&mut self, _handle: u16, params: ConnParams) -> Result<(), Self::Error> {
        self.params.push(params);
        Ok(())
    }

    fn notify(&mut self, channel: Channel, payload: &[u8]) -> Result<(), Self::Error> {
        if self.fail_notify {
            return Err(());
        }
        self.sent.push((channel, payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Default)]
pub struct MockAudio {
    pub running: bool,
    pub starts: u32,
    pub stops: u32,
    pub released: bool,
    pub frames: VecDeque<Vec<u8>>,
    pub recorded: Vec<u8>,
    pub fail_start: bool,
}

impl AudioCapture for MockAudio {
    type Error = ();

    fn start(&mut self) -> Result<(), Self::Error> {
        if self.fail_start {
            return Err(());
        }
        self.running = true;
        self.starts += 1;
        self.recorded.clear();
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            self.stops += 1;
        }
        self.running = false;
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn next_frame(&mut self, out: &mut [u8; AUDIO_FRAME_BYTES]) -> Option<usize> {
        if !self.running {
            return None;
        }
        let frame = self.frames.pop_front()?;
        let len = frame.len().min(AUDIO_FRAME_BYTES);
        out[..len].copy_from_slice(&frame[..len]);
        self.recorded.extend_from_slice(&frame[..len]);
        Some(len)
    }

    fn recorded_len(&self) -> u32 {
        self.recorded.len() as u32
    }

    fn read_recorded(&self, offset: u32, out: &mut [u8]) -> usize {
        let start = (offset as usize).min(self.recorded.len());
        let len = out.len().min(self.recorded.len() - start);
        out[..len].copy_from_slice(&self.recorded[start..start + len]);
        len
    }
}

pub struct MockBoard {
    pub battery_mv: u16,
    pub charging: bool,
    pub display_on: bool,
    pub backlight: u8,
    pub ceilings: Vec<CpuCeiling>,
    pub powered_off: bool,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self {
            battery_mv: 3_900,
            charging: false,
            display_on: true,
            backlight: 0,
            ceilings: Vec::new(),
            powered_off: false,
        }
    }
}

impl PowerBoard for MockBoard {
    type Error = ();

    fn set_cpu_ceiling(&mut self, ceiling: CpuCeiling) {
        self.ceilings.push(ceiling);
    }

    fn set_cpu_lock(&mut self, _held: bool) {}

    fn set_display_power(&mut self, on: bool) -> Result<(), Self::Error> {
        self.display_on = on;
        Ok(())
    }

    fn set_backlight(&mut self, level: u8) {
        self.backlight = level;
    }

    fn battery_voltage_mv(&mut self) -> Result<u16, Self::Error> {
        Ok(self.battery_mv)
    }

    fn is_charging(&mut self) -> Result<bool, Self::Error> {
        Ok(self.charging)
    }

    fn show_low_battery_warning(&mut self, _hold_ms: u32) {}

    fn power_off(&mut self) -> Halt {
        self.powered_off = true;
        Halt::Shutdown
    }
}

#[derive(Default)]
pub struct MockSink {
    pub image: Vec<u8>,
    pub finished: bool,
}

impl FirmwareSink for MockSink {
    type Error = ();

    fn begin(&mut self, _size: u32) -> Result<(), Self::Error> {
        self.image.clear();
        self.finished = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.image.extend_from_slice(data);
        Ok(data.len())
    }

    fn finish(&mut self) -> Result<(), Self::Error> {
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.image.clear();
    }
}

#[derive(Default)]
pub struct MockPanel {
    pub touched: bool,
    pub int_low: bool,
}

impl TouchPanel for MockPanel {
    type Error = ();

    fn int_asserted(&mut self) -> bool {
        self.int_low
    }

    fn read_touch(&mut self) -> Result<Option<TouchPoint>, Self::Error> {
        Ok(self.touched.then_some(TouchPoint { x: 0, y: 0 }))
    }
}

#[derive(Default)]
pub struct MockShutdown {
    pub steps: Vec<&'static str>,
    pub arm_fails: bool,
}

impl ShutdownSequence for MockShutdown {
    fn sleep_display(&mut self) {
        self.steps.push("display");
    }

    fn teardown_radio(&mut self) {
        self.steps.push("radio");
    }

    fn cut_rails(&mut self) {
        self.steps.push("rails");
    }

    fn touch_monitor_mode(&mut self) {
        self.steps.push("touch");
    }

    fn arm_wake_sources(&mut self) -> Result<(), ArmError> {
        self.steps.push("arm");
        if self.arm_fails { Err(ArmError) } else { Ok(()) }
    }

    fn sleep(&mut self) -> Halt {
        self.steps.push("sleep");
        Halt::DeepSleep
    }

    fn restart(&mut self) -> Halt {
        self.steps.push("restart");
        Halt::Restart
    }
}

#[derive(Default)]
pub struct MockStore {
    pub record: Option<ClockRecord>,
    pub saves: u32,
}

impl ClockStore for MockStore {
    type Error = ();

    fn load(&mut self) -> Result<Option<ClockRecord>, Self::Error> {
        Ok(self.record)
    }

    fn save(&mut self, record: &ClockRecord) -> Result<(), Self::Error> {
        self.record = Some(*record);
        self.saves += 1;
        Ok(())
    }
}
