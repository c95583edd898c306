//! Firmware image writer for the inactive OTA app slot.
//!
//! Incoming bytes are staged into whole flash sectors so every sector is
//! erased and programmed exactly once.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::{
    ota::OtaImageState,
    ota_updater::OtaUpdater,
    partitions::PARTITION_TABLE_MAX_LEN,
};
use esp_storage::FlashStorage;
use log::{info, warn};
use murmur_core::ota::FirmwareSink;

const SECTOR_BYTES: usize = 4096;
const IMAGE_MAGIC: u8 = 0xE9;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OtaFlashError {
    PartitionTable,
    NoUpdateSlot,
    ImageTooLarge,
    FlashWrite,
    NotStarted,
    BadImage,
    Activate,
}

pub struct OtaFlashSink<'d> {
    flash: FlashStorage<'d>,
    table: [u8; PARTITION_TABLE_MAX_LEN],
    staging: [u8; SECTOR_BYTES],
    staged: usize,
    /// Slot offset of the next sector to program.
    cursor: u32,
    expected: Option<u32>,
    first_byte: Option<u8>,
}

impl<'d> OtaFlashSink<'d> {
    pub fn new(flash: FlashStorage<'d>) -> Self {
        Self {
            flash,
            table: [0; PARTITION_TABLE_MAX_LEN],
            staging: [0xFF; SECTOR_BYTES],
            staged: 0,
            cursor: 0,
            expected: None,
            first_byte: None,
        }
    }

    /// Confirms the running image so a rollback-enabled bootloader keeps it.
    pub fn mark_running_valid(&mut self) -> Result<(), OtaFlashError> {
        let mut updater = OtaUpdater::new(&mut self.flash, &mut self.table)
            .map_err(|_| OtaFlashError::PartitionTable)?;
        match updater.current_ota_state() {
            Ok(OtaImageState::New | OtaImageState::PendingVerify) => {
                updater
                    .set_current_ota_state(OtaImageState::Valid)
                    .map_err(|_| OtaFlashError::Activate)?;
                info!("ota-flash: running image marked valid");
            }
            Ok(_) => {}
            Err(_) => warn!("ota-flash: no ota state; factory boot"),
        }
        Ok(())
    }

    fn slot_capacity(&mut self) -> Result<usize, OtaFlashError> {
        let mut updater = OtaUpdater::new(&mut self.flash, &mut self.table)
            .map_err(|_| OtaFlashError::PartitionTable)?;
        let (slot, _) = updater
            .next_partition()
            .map_err(|_| OtaFlashError::NoUpdateSlot)?;
        Ok(slot.capacity())
    }

    fn flush_staging(&mut self) -> Result<(), OtaFlashError> {
        if self.staged == 0 {
            return Ok(());
        }

        let len = self.staged.next_multiple_of(4);
        self.staging[self.staged..len].fill(0xFF);

        let mut updater = OtaUpdater::new(&mut self.flash, &mut self.table)
            .map_err(|_| OtaFlashError::PartitionTable)?;
        let (mut slot, _) = updater
            .next_partition()
            .map_err(|_| OtaFlashError::NoUpdateSlot)?;
        slot.write(self.cursor, &self.staging[..len])
            .map_err(|_| OtaFlashError::FlashWrite)?;

        self.cursor += SECTOR_BYTES as u32;
        self.staged = 0;
        self.staging.fill(0xFF);
        Ok(())
    }

    fn reset(&mut self) {
        self.staged = 0;
        self.cursor = 0;
        self.expected = None;
        self.first_byte = None;
        self.staging.fill(0xFF);
    }
}

impl FirmwareSink for OtaFlashSink<'_> {
    type Error = OtaFlashError;

    fn begin(&mut self, size: u32) -> Result<(), Self::Error> {
        self.reset();
        let capacity = self.slot_capacity()?;
        if size as usize > capacity {
            warn!(
                "ota-flash: image size={} exceeds slot capacity={}",
                size, capacity
            );
            return Err(OtaFlashError::ImageTooLarge);
        }
        self.expected = Some(size);
        info!("ota-flash: begin size={} capacity={}", size, capacity);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        if self.expected.is_none() {
            return Err(OtaFlashError::NotStarted);
        }
        if self.first_byte.is_none() {
            self.first_byte = data.first().copied();
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(SECTOR_BYTES - self.staged);
            self.staging[self.staged..self.staged + take].copy_from_slice(&rest[..take]);
            self.staged += take;
            rest = &rest[take..];
            if self.staged == SECTOR_BYTES {
                self.flush_staging()?;
            }
        }
        Ok(data.len())
    }

    fn finish(&mut self) -> Result<(), Self::Error> {
        if self.expected.is_none() {
            return Err(OtaFlashError::NotStarted);
        }
        if self.first_byte != Some(IMAGE_MAGIC) {
            warn!("ota-flash: image header magic mismatch");
            return Err(OtaFlashError::BadImage);
        }
        self.flush_staging()?;

        let mut updater = OtaUpdater::new(&mut self.flash, &mut self.table)
            .map_err(|_| OtaFlashError::PartitionTable)?;
        updater
            .activate_next_partition()
            .map_err(|_| OtaFlashError::Activate)?;
        updater
            .set_current_ota_state(OtaImageState::New)
            .map_err(|_| OtaFlashError::Activate)?;
        info!(
            "ota-flash: next slot activated sectors={}",
            self.cursor / SECTOR_BYTES as u32
        );
        self.expected = None;
        Ok(())
    }

    fn abort(&mut self) {
        if self.expected.is_some() {
            info!("ota-flash: partial image discarded at {} bytes", self.cursor);
        }
        self.reset();
    }
}
