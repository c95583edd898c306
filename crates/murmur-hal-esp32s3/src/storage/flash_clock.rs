use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use log::info;
use murmur_core::clock::{ClockRecord, ClockStore};

const FLASH_SECTOR_SIZE: u32 = 4096;
const DEFAULT_FLASH_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

const CLOCK_MAGIC: u32 = 0x314B_434D; // "MCK1"
const CLOCK_VERSION: u8 = 1;
const CLOCK_RECORD_LEN: usize = 24;
const CLOCK_CHECKSUM_AT: usize = CLOCK_RECORD_LEN - 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashClockError {
    PartitionTable,
    ClockPartitionMissing,
    FlashOpFailed(i32),
    Corrupted,
    Unsupported,
}

#[derive(Debug)]
struct RawFlash;

impl RawFlash {
    fn new() -> Result<Self, FlashClockError> {
        let rc = unsafe { esp_rom_spiflash_unlock() };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashClockError::FlashOpFailed(rc));
        }
        Ok(Self)
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), FlashClockError> {
        if !sector_addr.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(FlashClockError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_erase_sector(sector_addr / FLASH_SECTOR_SIZE) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashClockError::FlashOpFailed(rc));
        }
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, FlashClockError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashClockError::Unsupported);
        }

        let mut word = 0u32;
        let rc = unsafe { esp_rom_spiflash_read(addr, &mut word as *mut u32 as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashClockError::FlashOpFailed(rc));
        }
        Ok(word)
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), FlashClockError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashClockError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_write(addr, &word as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashClockError::FlashOpFailed(rc));
        }
        Ok(())
    }

    /// Word-granular read; `addr` and `out.len()` must both be word aligned.
    fn read_words(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashClockError> {
        if !out.len().is_multiple_of(4) {
            return Err(FlashClockError::Unsupported);
        }
        for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
            let word = self.read_word(addr + (i as u32) * 4)?;
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn write_words(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashClockError> {
        if !data.len().is_multiple_of(4) {
            return Err(FlashClockError::Unsupported);
        }
        for (i, chunk) in data.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.write_word(addr + (i as u32) * 4, word)?;
        }
        Ok(())
    }
}

impl ReadStorage for RawFlash {
    type Error = FlashClockError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        // Partition table reads are word aligned in both offset and length.
        self.read_words(offset, bytes)
    }

    fn capacity(&self) -> usize {
        DEFAULT_FLASH_CAPACITY_BYTES
    }
}

impl Storage for RawFlash {
    fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Err(FlashClockError::Unsupported)
    }
}

/// Last known wall-clock time, kept in the final sector of the first
/// writable data partition.
#[derive(Debug)]
pub struct FlashClockStore {
    flash: RawFlash,
    sector_addr: u32,
}

impl FlashClockStore {
    pub fn new() -> Result<Self, FlashClockError> {
        let mut flash = RawFlash::new()?;

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf)
            .map_err(|_| FlashClockError::PartitionTable)?;

        let mut data_undefined: Option<(u32, u32)> = None;
        let mut fallback_nvs: Option<(u32, u32)> = None;

        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < FLASH_SECTOR_SIZE {
                continue;
            }

            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) => {
                    data_undefined = Some((entry.offset(), entry.len()));
                    break;
                }
                PartitionType::Data(DataPartitionSubType::Nvs) if fallback_nvs.is_none() => {
                    fallback_nvs = Some((entry.offset(), entry.len()));
                }
                _ => {}
            }
        }

        let (offset, len) = data_undefined
            .or(fallback_nvs)
            .ok_or(FlashClockError::ClockPartitionMissing)?;

        let sector_addr = offset + len - FLASH_SECTOR_SIZE;
        info!("clock-store: sector=0x{:x}", sector_addr);
        Ok(Self { flash, sector_addr })
    }
}

impl ClockStore for FlashClockStore {
    type Error = FlashClockError;

    fn load(&mut self) -> Result<Option<ClockRecord>, Self::Error> {
        let mut buf = [0u8; CLOCK_RECORD_LEN];
        self.flash.read_words(self.sector_addr, &mut buf)?;
        decode_record(&buf)
    }

    fn save(&mut self, record: &ClockRecord) -> Result<(), Self::Error> {
        let buf = encode_record(record);
        self.flash.erase_sector(self.sector_addr)?;
        self.flash.write_words(self.sector_addr, &buf)
    }
}

fn encode_record(record: &ClockRecord) -> [u8; CLOCK_RECORD_LEN] {
    let mut buf = [0u8; CLOCK_RECORD_LEN];
    buf[0..4].copy_from_slice(&CLOCK_MAGIC.to_le_bytes());
    buf[4] = CLOCK_VERSION;
    buf[8..16].copy_from_slice(&record.epoch_s.to_le_bytes());
    buf[16..20].copy_from_slice(&record.offset_s.to_le_bytes());
    let checksum = checksum32(&buf[..CLOCK_CHECKSUM_AT]);
    buf[CLOCK_CHECKSUM_AT..].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8; CLOCK_RECORD_LEN]) -> Result<Option<ClockRecord>, FlashClockError> {
    if buf.iter().all(|b| *b == 0xFF) {
        return Ok(None);
    }

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != CLOCK_MAGIC || buf[4] != CLOCK_VERSION {
        return Ok(None);
    }

    let expected = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
    if checksum32(&buf[..CLOCK_CHECKSUM_AT]) != expected {
        return Err(FlashClockError::Corrupted);
    }

    let mut epoch = [0u8; 8];
    epoch.copy_from_slice(&buf[8..16]);
    let offset = i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    Ok(Some(ClockRecord {
        epoch_s: i64::from_le_bytes(epoch),
        offset_s: offset,
    }))
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
