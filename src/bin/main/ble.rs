use embassy_futures::{
    join::join,
    select::{Either, select},
};
use embassy_time::{Duration, Timer, with_timeout};
use log::{debug, info, warn};
use murmur_core::{
    inbox::LinkEvent,
    link::{AdvertisingProfile, Channel, ConnParams, PeerAddress},
    protocol::FILE_REQUEST,
};
use murmur_hal_esp32s3::network::{NOTIFY_BYTES, RadioCommand};
use trouble_host::prelude::*;

use super::{DEVICE_NAME, INBOX, LINK_STATUS, RADIO_COMMANDS, RADIO_DOWN, now_ms};

const CONNECTIONS_MAX: usize = 1;
const L2CAP_CHANNELS_MAX: usize = 2;
const HOST_RETRY_MS: u64 = 1_000;
const NOTIFY_ATTEMPTS: u8 = 3;
const NOTIFY_RETRY_MS: u64 = 10;
const DISCONNECT_WAIT_MS: u64 = 300;

const CONTROL_SERVICE_UUID: [u8; 16] = [
    0x4b, 0x91, 0x31, 0xc3, 0xc9, 0xc5, 0xcc, 0x8f, 0x9e, 0x45, 0xb5, 0x1f, 0x01, 0xc2, 0xaf, 0x4f,
];

#[gatt_server]
struct Server {
    control: ControlService,
    file: FileService,
    ota: OtaService,
}

/// Audio frames and control messages out, text in.
#[gatt_service(uuid = "4fafc201-1fb5-459e-8fcc-c5c9c331914b")]
struct ControlService {
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26a8", write, write_without_response, notify)]
    data: heapless::Vec<u8, NOTIFY_BYTES>,
}

#[gatt_service(uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e")]
struct FileService {
    #[characteristic(uuid = "6e400002-b5a3-f393-e0a9-e50e24dcca9e", write, notify)]
    data: heapless::Vec<u8, NOTIFY_BYTES>,
}

#[gatt_service(uuid = "12345678-1234-5678-1234-56789abcdef0")]
struct OtaService {
    #[characteristic(uuid = "12345678-1234-5678-1234-56789abcdef1", write, write_without_response, notify)]
    data: heapless::Vec<u8, NOTIFY_BYTES>,
}

/// Runs the BLE host and the peripheral role forever.
pub(super) async fn run<C: Controller>(controller: C, address: [u8; 6]) {
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> =
        HostResources::new();
    let stack =
        trouble_host::new(controller, &mut resources).set_random_address(Address::random(address));
    let Host {
        mut peripheral,
        runner,
        ..
    } = stack.build();

    let server = match Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: DEVICE_NAME,
        appearance: &appearance::watch::SMARTWATCH,
    })) {
        Ok(server) => server,
        Err(err) => {
            warn!("ble: gatt server init failed: {:?}", err);
            return;
        }
    };
    info!("ble: host ready name={}", DEVICE_NAME);

    let _ = join(host_loop(runner), peripheral_loop(&stack, &mut peripheral, &server)).await;
}

async fn host_loop<C: Controller>(mut runner: Runner<'_, C, DefaultPacketPool>) {
    loop {
        if let Err(err) = runner.run().await {
            warn!("ble: host runner stopped: {:?}", err);
            Timer::after_millis(HOST_RETRY_MS).await;
        }
    }
}

async fn peripheral_loop<C: Controller>(
    stack: &Stack<'_, C, DefaultPacketPool>,
    peripheral: &mut Peripheral<'_, C, DefaultPacketPool>,
    server: &Server<'_>,
) {
    let mut profile = AdvertisingProfile::Fast;
    loop {
        match advertise(peripheral, profile).await {
            Advertised::Connected(conn) => match conn.with_attribute_server(server) {
                Ok(conn) => {
                    if serve(stack, server, &conn, &mut profile).await == Served::TornDown {
                        park().await;
                    }
                }
                Err(err) => warn!("ble: attribute server attach failed: {:?}", err),
            },
            Advertised::Profile(next) => profile = next,
            Advertised::TornDown => park().await,
            Advertised::Failed => Timer::after_millis(HOST_RETRY_MS).await,
        }
    }
}

enum Advertised<'a> {
    Connected(Connection<'a, DefaultPacketPool>),
    Profile(AdvertisingProfile),
    TornDown,
    Failed,
}

async fn advertise<'a, C: Controller>(
    peripheral: &mut Peripheral<'a, C, DefaultPacketPool>,
    profile: AdvertisingProfile,
) -> Advertised<'a> {
    let mut adv_data = [0u8; 31];
    let adv_len = match AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids128(&[CONTROL_SERVICE_UUID]),
        ],
        &mut adv_data[..],
    ) {
        Ok(len) => len,
        Err(err) => {
            warn!("ble: advertisement encode failed: {:?}", err);
            return Advertised::Failed;
        }
    };
    let mut scan_data = [0u8; 31];
    let scan_len = match AdStructure::encode_slice(
        &[AdStructure::CompleteLocalName(DEVICE_NAME.as_bytes())],
        &mut scan_data[..],
    ) {
        Ok(len) => len,
        Err(err) => {
            warn!("ble: scan response encode failed: {:?}", err);
            return Advertised::Failed;
        }
    };

    let interval = profile.interval();
    let params = AdvertisementParameters {
        interval_min: Duration::from_micros(interval.min_us() as u64),
        interval_max: Duration::from_micros(interval.max_us() as u64),
        ..Default::default()
    };
    let advertiser = match peripheral
        .advertise(
            &params,
            Advertisement::ConnectableScannableUndirected {
                adv_data: &adv_data[..adv_len],
                scan_data: &scan_data[..scan_len],
            },
        )
        .await
    {
        Ok(advertiser) => advertiser,
        Err(err) => {
            warn!("ble: advertise failed: {:?}", err);
            return Advertised::Failed;
        }
    };
    LINK_STATUS.mark_advertising();
    info!("ble: advertising profile={}", profile.as_str());

    loop {
        match select(advertiser.accept(), RADIO_COMMANDS.receive()).await {
            Either::First(Ok(conn)) => return Advertised::Connected(conn),
            Either::First(Err(err)) => {
                warn!("ble: accept failed: {:?}", err);
                return Advertised::Failed;
            }
            // A repeat of the current profile is a liveness kick; reissue it.
            Either::Second(RadioCommand::Advertise(next)) => return Advertised::Profile(next),
            Either::Second(RadioCommand::Teardown) => return Advertised::TornDown,
            // Nothing to notify or tune without a peer.
            Either::Second(_) => {}
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Served {
    Disconnected,
    TornDown,
}

async fn serve<C: Controller, P: PacketPool>(
    stack: &Stack<'_, C, P>,
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, P>,
    profile: &mut AdvertisingProfile,
) -> Served {
    let handle = conn.raw().handle().raw();
    let peer = PeerAddress(conn.raw().peer_address().into_inner());
    LINK_STATUS.mark_connected();
    let _ = INBOX.push(LinkEvent::Connected { peer, handle });
    info!("ble: connected handle={}", handle);

    loop {
        match select(conn.next(), RADIO_COMMANDS.receive()).await {
            Either::First(GattConnectionEvent::Disconnected { reason }) => {
                info!("ble: disconnected reason={:?}", reason);
                LINK_STATUS.mark_disconnected();
                let _ = INBOX.push(LinkEvent::Disconnected);
                return Served::Disconnected;
            }
            Either::First(GattConnectionEvent::Gatt { event }) => {
                if let GattEvent::Write(write) = &event {
                    route_write(server, write.handle(), write.data());
                }
                match event.accept() {
                    Ok(reply) => reply.send().await,
                    Err(err) => warn!("ble: gatt reply failed: {:?}", err),
                }
            }
            Either::First(_) => {}
            Either::Second(RadioCommand::Notify { channel, payload }) => {
                let characteristic = match channel {
                    Channel::Control => &server.control.data,
                    Channel::File => &server.file.data,
                    Channel::Ota => &server.ota.data,
                };
                notify_with_retry(characteristic, conn, &payload).await;
            }
            Either::Second(RadioCommand::UpdateParams { params, .. }) => {
                update_params(stack, conn, params).await;
            }
            Either::Second(RadioCommand::Advertise(next)) => *profile = next,
            Either::Second(RadioCommand::Teardown) => {
                conn.raw().disconnect();
                LINK_STATUS.mark_torn_down();
                let drained = with_timeout(Duration::from_millis(DISCONNECT_WAIT_MS), async {
                    while !matches!(conn.next().await, GattConnectionEvent::Disconnected { .. }) {}
                })
                .await;
                if drained.is_err() {
                    warn!("ble: peer did not confirm disconnect");
                }
                info!("ble: torn down");
                return Served::TornDown;
            }
        }
    }
}

async fn notify_with_retry<P: PacketPool>(
    characteristic: &Characteristic<heapless::Vec<u8, NOTIFY_BYTES>>,
    conn: &GattConnection<'_, '_, P>,
    payload: &heapless::Vec<u8, NOTIFY_BYTES>,
) {
    for attempt in 1..=NOTIFY_ATTEMPTS {
        match characteristic.notify(conn, payload).await {
            Ok(()) => return,
            Err(err) if attempt < NOTIFY_ATTEMPTS => {
                debug!("ble: notify attempt {} failed: {:?}", attempt, err);
                Timer::after_millis(NOTIFY_RETRY_MS).await;
            }
            Err(err) => warn!("ble: notify failed: {:?}", err),
        }
    }
}

fn route_write(server: &Server<'_>, handle: u16, data: &[u8]) {
    if handle == server.control.data.handle {
        let _ = INBOX.push_text(data, now_ms());
    } else if handle == server.ota.data.handle {
        let _ = INBOX.push_ota(data);
    } else if handle == server.file.data.handle {
        if data == [FILE_REQUEST] {
            let _ = INBOX.push(LinkEvent::FileRequest);
        }
    } else if server.control.data.cccd_handle == Some(handle) {
        let on = data.first().is_some_and(|flags| flags & 0x01 != 0);
        let _ = INBOX.push(LinkEvent::Subscribed(on));
    }
}

async fn update_params<C: Controller, P: PacketPool>(
    stack: &Stack<'_, C, P>,
    conn: &GattConnection<'_, '_, P>,
    params: ConnParams,
) {
    let request = ConnectParams {
        min_connection_interval: Duration::from_micros(params.interval_min_us() as u64),
        max_connection_interval: Duration::from_micros(params.interval_max_us() as u64),
        max_latency: params.latency,
        supervision_timeout: Duration::from_millis(params.supervision_timeout_ms() as u64),
        ..Default::default()
    };
    if let Err(err) = conn.raw().update_connection_params(stack, &request).await {
        warn!("ble: connection parameter update rejected: {:?}", err);
    }
}

/// Holds the host idle once the radio is torn down for deep sleep.
async fn park() {
    RADIO_DOWN.signal(());
    loop {
        Timer::after_secs(60).await;
    }
}
