use embassy_time::Timer;
use esp_hal::{Async, i2s::master::I2sRx};
use log::{info, warn};

use super::MIC;

const CHUNK_BYTES: usize = 1_024;
const RETRY_MS: u64 = 250;

/// Streams DMA audio into [`MIC`] whenever the main loop has a recording
/// open. The circular transfer only runs while recording.
pub(super) async fn capture_loop(mut rx: I2sRx<'static, Async>, buffer: &'static mut [u8]) {
    let mut chunk = [0u8; CHUNK_BYTES];
    loop {
        MIC.wait_for_start().await;
        if MIC.is_released() {
            info!("mic: capture released");
            return;
        }

        let mut transfer = match rx.read_dma_circular_async(&mut *buffer) {
            Ok(transfer) => transfer,
            Err(err) => {
                warn!("mic: dma start failed: {:?}", err);
                Timer::after_millis(RETRY_MS).await;
                continue;
            }
        };

        while MIC.is_running() {
            let avail = match transfer.available().await {
                Ok(avail) => avail.min(CHUNK_BYTES),
                Err(err) => {
                    warn!("mic: dma stalled: {:?}", err);
                    break;
                }
            };
            match transfer.pop(&mut chunk[..avail]).await {
                Ok(len) => {
                    if MIC.is_running() {
                        let _ = MIC.feed(&chunk[..len]);
                    }
                }
                Err(err) => {
                    warn!("mic: dma read failed: {:?}", err);
                    break;
                }
            }
        }
    }
}
