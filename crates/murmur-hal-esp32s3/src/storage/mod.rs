pub mod flash_clock;
pub mod ota_flash;
