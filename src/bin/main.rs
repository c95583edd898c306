#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::cell::RefCell;

use bt_hci::controller::ExternalController;
use critical_section::Mutex;
use embassy_executor::Spawner;
use embassy_futures::join::join3;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Duration, Instant as EmbassyInstant, Timer, with_timeout};
use embedded_hal_bus::i2c::CriticalSectionDevice;
use esp_hal::{
    Async, Blocking,
    clock::CpuClock,
    delay::Delay,
    dma_buffers,
    efuse::Efuse,
    gpio::{Input, InputConfig, Pull},
    i2c::master::{Config as I2cConfig, I2c},
    i2s::master::{Config as I2sConfig, DataFormat, I2s, I2sRx},
    ledc::{
        LSGlobalClkSource, Ledc, LowSpeed,
        channel::{self, ChannelIFace},
        timer::{self, TimerIFace},
    },
    rtc_cntl::{reset_reason, wakeup_cause},
    system::Cpu,
    time::Rate,
    timer::timg::TimerGroup,
};
use esp_radio::ble::controller::BleConnector;
use esp_storage::FlashStorage;
use ft6336::Ft6336;
use log::{LevelFilter, info, warn};
use murmur_core::{
    audio::{ClipRecorder, MAX_RECORDING_BYTES},
    firmware::{Firmware, FirmwareConfig, Peripherals, Platform, TickOutcome},
    inbox::LinkInbox,
    power::Halt,
    wake::{WakeConfig, WakeSource, WakeVerdict, validate_wake},
};
use murmur_hal_esp32s3::{
    audio::{MIC_SAMPLE_RATE_HZ, MicControl, MicSource},
    input::touch::TouchInput,
    network::{BleRadio, LinkStatusHandle, RadioCommands},
    platform::{
        board::WatchBoard,
        pmu::Axp2101,
        sleep::RtcWakeProbe,
    },
    storage::{flash_clock::FlashClockStore, ota_flash::OtaFlashSink},
};
use static_cell::{ConstStaticCell, StaticCell};

use power::WatchShutdown;

#[path = "main/ble.rs"]
mod ble;
#[path = "main/mic.rs"]
mod mic;
#[path = "main/power.rs"]
mod power;

const DEVICE_NAME: &str = match option_env!("MURMUR_DEVICE_NAME") {
    Some(name) => name,
    None => "Murmur",
};
const I2C_KHZ: u32 = 400;
const BACKLIGHT_PWM_KHZ: u32 = 24;
const BLE_SLOTS: usize = 20;
const RADIO_DOWN_WAIT_MS: u64 = 1_000;

type SharedI2c = CriticalSectionDevice<'static, I2c<'static, Blocking>>;
type I2cBus = Mutex<RefCell<I2c<'static, Blocking>>>;
type Backlight = channel::Channel<'static, LowSpeed>;
type Clip = ClipRecorder<MicSource, MAX_RECORDING_BYTES>;

static INBOX: LinkInbox = LinkInbox::new();
static LINK_STATUS: LinkStatusHandle = LinkStatusHandle::new();
static RADIO_COMMANDS: RadioCommands = RadioCommands::new();
/// Raised by the host task once the controller is idle for deep sleep.
static RADIO_DOWN: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static MIC: MicControl = MicControl::new();
static CLIP: ConstStaticCell<Clip> = ConstStaticCell::new(ClipRecorder::new(MicSource::new(&MIC)));
static PMU_BUS: StaticCell<I2cBus> = StaticCell::new();
static TOUCH_BUS: StaticCell<I2cBus> = StaticCell::new();
static BACKLIGHT_TIMER: StaticCell<timer::Timer<'static, LowSpeed>> = StaticCell::new();

fn now_ms() -> u64 {
    EmbassyInstant::now().as_millis()
}

struct Watch;

impl Platform for Watch {
    type Board = WatchBoard<SharedI2c, Backlight, Delay>;
    type Radio = BleRadio;
    type Sink = OtaFlashSink<'static>;
    type Audio = &'static mut Clip;
    type Touch = TouchInput<SharedI2c, Input<'static>>;
    type Store = Option<FlashClockStore>;
    type Shutdown = WatchShutdown<SharedI2c, SharedI2c>;
}

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Logs a fatal bring-up failure and parks the core.
fn halt_boot(what: &str) -> ! {
    esp_println::println!("boot: {} failed; halting", what);
    loop {
        core::hint::spin_loop();
    }
}

fn random_static_address() -> [u8; 6] {
    let mut address = Efuse::mac_address();
    // Static random addresses carry 0b11 in the two top bits.
    address[5] |= 0xC0;
    address
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger(LevelFilter::Info);
    esp_println::println!("boot: murmur starting");

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    info!(
        "boot reset_reason={:?} wakeup_cause={:?}",
        reset_reason(Cpu::ProCpu),
        wakeup_cause()
    );

    // PMU: SDA=GPIO10 SCL=GPIO11. Touch: SDA=GPIO39 SCL=GPIO40 INT=GPIO16.
    let i2c_config = I2cConfig::default().with_frequency(Rate::from_khz(I2C_KHZ));
    let pmu_i2c = match I2c::new(peripherals.I2C0, i2c_config) {
        Ok(i2c) => i2c.with_sda(peripherals.GPIO10).with_scl(peripherals.GPIO11),
        Err(err) => {
            info!("pmu i2c config failed: {:?}", err);
            halt_boot("pmu i2c");
        }
    };
    let touch_i2c = match I2c::new(peripherals.I2C1, i2c_config) {
        Ok(i2c) => i2c.with_sda(peripherals.GPIO39).with_scl(peripherals.GPIO40),
        Err(err) => {
            info!("touch i2c config failed: {:?}", err);
            halt_boot("touch i2c");
        }
    };
    let pmu_bus: &'static I2cBus = PMU_BUS.init(Mutex::new(RefCell::new(pmu_i2c)));
    let touch_bus: &'static I2cBus = TOUCH_BUS.init(Mutex::new(RefCell::new(touch_i2c)));

    let touch_int = Input::new(
        peripherals.GPIO16,
        InputConfig::default().with_pull(Pull::Up),
    );
    let mut touch = TouchInput::new(
        Ft6336::new(CriticalSectionDevice::new(touch_bus), ft6336::Config::default()),
        touch_int,
    );
    let mut shutdown = WatchShutdown::new(
        Axp2101::new(CriticalSectionDevice::new(pmu_bus)),
        Ft6336::new(CriticalSectionDevice::new(touch_bus), ft6336::Config::default()),
    );

    let verdict = validate_wake(
        &mut RtcWakeProbe::new(&mut touch, Delay::new()),
        &WakeConfig::default(),
    );
    match verdict {
        WakeVerdict::BackToSleep(reason) => {
            info!("boot: spurious wake {:?}; back to sleep", reason);
            shutdown.rearm_and_sleep();
        }
        WakeVerdict::Proceed(source) => info!("boot: deep sleep wake source={:?}", source),
        WakeVerdict::ColdBoot => info!("boot: cold boot"),
    }

    // esp-radio requires an allocator.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Backlight PWM on GPIO45.
    let mut ledc = Ledc::new(peripherals.LEDC);
    ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);
    let backlight_timer = BACKLIGHT_TIMER.init(ledc.timer::<LowSpeed>(timer::Number::Timer0));
    if let Err(err) = backlight_timer.configure(timer::config::Config {
        duty: timer::config::Duty::Duty8Bit,
        clock_source: timer::LSClockSource::APBClk,
        frequency: Rate::from_khz(BACKLIGHT_PWM_KHZ),
    }) {
        info!("backlight timer config failed: {:?}", err);
    }
    let backlight_timer: &'static timer::Timer<'static, LowSpeed> = backlight_timer;
    let mut backlight = ledc.channel(channel::Number::Channel0, peripherals.GPIO45);
    if let Err(err) = backlight.configure(channel::config::Config {
        timer: backlight_timer,
        duty_pct: 100,
        pin_config: channel::config::PinConfig::PushPull,
    }) {
        info!("backlight channel config failed: {:?}", err);
    }

    let mut board = WatchBoard::new(
        Axp2101::new(CriticalSectionDevice::new(pmu_bus)),
        backlight,
        Delay::new(),
    );
    if let Err(err) = board.initialize() {
        warn!("board initialize failed: {:?}", err);
    }

    let radio = match esp_radio::init() {
        Ok(radio) => radio,
        Err(err) => {
            info!("esp-radio init failed: {:?}", err);
            loop {
                Timer::after_secs(1).await;
            }
        }
    };
    let connector = match BleConnector::new(&radio, peripherals.BT, Default::default()) {
        Ok(connector) => connector,
        Err(err) => {
            info!("ble connector init failed: {:?}", err);
            loop {
                Timer::after_secs(1).await;
            }
        }
    };
    let controller: ExternalController<_, BLE_SLOTS> = ExternalController::new(connector);

    let store = match FlashClockStore::new() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!("clock store unavailable: {:?}", err);
            None
        }
    };
    let mut sink = OtaFlashSink::new(FlashStorage::new(peripherals.FLASH));
    if let Err(err) = sink.mark_running_valid() {
        warn!("ota state check failed: {:?}", err);
    }

    // Mic: PDM CLK=GPIO44 DATA=GPIO47.
    let (rx_buffer, rx_descriptors, _, _) = dma_buffers!(4 * 4092, 0);
    let mic_rx: Option<I2sRx<'static, Async>> = match I2s::new(
        peripherals.I2S0,
        peripherals.DMA_CH0,
        I2sConfig::new_tdm_philips()
            .with_sample_rate(Rate::from_hz(MIC_SAMPLE_RATE_HZ))
            .with_data_format(DataFormat::Data16Channel16),
    ) {
        // TODO: switch to PDM RX once esp-hal exposes it; standard mode
        // clocks the mic but leaves the raw bitstream undecimated.
        Ok(i2s) => Some(
            i2s.into_async()
                .i2s_rx
                .with_ws(peripherals.GPIO44)
                .with_din(peripherals.GPIO47)
                .build(rx_descriptors),
        ),
        Err(err) => {
            warn!("mic i2s config failed: {:?}", err);
            None
        }
    };

    let peripherals = Peripherals::<Watch> {
        board,
        radio: BleRadio::new(&RADIO_COMMANDS, &LINK_STATUS),
        sink,
        audio: CLIP.take(),
        touch,
        store,
        shutdown,
    };
    let mut firmware = Firmware::new(peripherals, &INBOX, FirmwareConfig::default(), now_ms());
    firmware.start(now_ms());
    if verdict == WakeVerdict::Proceed(WakeSource::Touch) {
        firmware.consume_wake_touch();
    }

    info!(
        "murmur started: name={} backlight=GPIO45 mic_rate={}Hz",
        DEVICE_NAME, MIC_SAMPLE_RATE_HZ
    );

    let ble_future = ble::run(controller, random_static_address());
    let mic_future = async {
        match mic_rx {
            Some(rx) => mic::capture_loop(rx, rx_buffer).await,
            None => info!("mic: capture disabled"),
        }
    };
    let main_future = async {
        let halt = loop {
            match firmware.tick(now_ms()) {
                TickOutcome::Continue { delay_ms } => {
                    Timer::after_millis(u64::from(delay_ms)).await;
                }
                TickOutcome::RadioTeardown => {
                    let wait = Duration::from_millis(RADIO_DOWN_WAIT_MS);
                    if with_timeout(wait, RADIO_DOWN.wait()).await.is_err() {
                        warn!("main: radio teardown timed out; sleeping anyway");
                    }
                    break firmware.finish_deep_sleep();
                }
                TickOutcome::Halt(halt) => break halt,
            }
        };
        // Deep sleep and restart never get here; a shutdown only returns
        // while external power keeps the chip alive.
        info!("main: halted {:?}", halt);
        if halt == Halt::Restart {
            esp_hal::system::software_reset();
        }
        loop {
            Timer::after_secs(1).await;
        }
    };

    let _ = join3(ble_future, mic_future, main_future).await;
    unreachable!()
}
