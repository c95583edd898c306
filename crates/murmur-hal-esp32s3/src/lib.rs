#![no_std]

//! ESP32-S3 watch board adapters for the murmur core traits.

pub mod audio;
pub mod input;
pub mod network;
pub mod platform;
pub mod storage;
