#![cfg_attr(not(test), no_std)]

//! Hardware-agnostic life-cycle core for the murmur wearable.
//!
//! Everything in here is driven by explicit `now_ms` timestamps and talks to
//! hardware only through the traits each module declares, so the whole
//! scheduler runs on the host under `cargo test`.

pub mod audio;
pub mod clock;
pub mod file;
pub mod firmware;
pub mod inbox;
pub mod link;
#[cfg(test)]
mod mock;
pub mod ota;
pub mod power;
pub mod protocol;
pub mod session;
pub mod touch;
pub mod wake;
