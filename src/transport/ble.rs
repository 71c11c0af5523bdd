//! Bluetooth Low Energy transport.
//!
//! The radio exposes one GATT service with three characteristics: `ToRadio`
//! (written with response), `FromRadio` (read repeatedly until it returns an
//! empty value) and `FromNum` (notifies when new data is queued). All GATT
//! operations go through an [`AsyncBridge`]; each `FromRadio` value is
//! re-framed with the stream codec so the reader loop handles BLE exactly like
//! serial and TCP.
//!
//! Firmware that streams its debug log over BLE adds a log characteristic
//! (`LogRecord` protobufs, or plain text on older builds). Those lines are
//! handed to the reader through [`Transport::take_log_lines`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central as _, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::encode_frame;
use crate::protocol::proto;
use crate::transport::bridge::{AsyncBridge, DEFAULT_JOIN_TIMEOUT, DEFAULT_RUN_TIMEOUT};
use crate::transport::{Transport, TransportKind};

/// Radio GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1_b218_15a8_461f_9fa8_5dca_e273_eafd);
/// Characteristic the client writes `ToRadio` messages to.
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c_76d2_129e_4dad_a1dd_7866_1244_01e7);
/// Characteristic the client reads `FromRadio` messages from.
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55_e69e_4993_11ed_b878_0242_ac12_0002);
/// Characteristic that notifies when `FromRadio` has data.
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9d_a18c_a800_4f66_a670_aa75_47e3_4453);
/// Characteristic that notifies device log output as `LogRecord` messages.
pub const LOGRADIO_UUID: Uuid = Uuid::from_u128(0x5a3d_6e49_06e6_4423_9944_e9de_8cdf_9547);
/// Older firmware's log characteristic: one UTF-8 text line per notification.
pub const LEGACY_LOGRADIO_UUID: Uuid = Uuid::from_u128(0x6c6f_d238_78fa_436b_aacf_15c5_be1e_f2e2);

/// Default scan duration.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Configuration for BLE transport.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device name or address to connect to; `None` accepts a single advertiser.
    pub device: Option<String>,
    /// How long to scan for advertisements.
    pub scan_timeout: Duration,
    /// Bound on each GATT operation.
    pub operation_timeout: Duration,
}

impl BleConfig {
    /// Creates a configuration for a named or addressed device.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            ..Self::any()
        }
    }

    /// Creates a configuration accepting the only advertising radio.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            device: None,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            operation_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    /// Sets the scan duration.
    #[must_use]
    pub const fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets the per-operation bound.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// An advertising radio found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
    /// Advertised local name.
    pub name: Option<String>,
    /// Hardware address as reported by the adapter.
    pub address: String,
}

impl BleDevice {
    /// Returns true if `filter` names this device or is part of its address.
    #[must_use]
    pub fn matches(&self, filter: &str) -> bool {
        if self.name.as_deref() == Some(filter) {
            return true;
        }
        let wanted = normalize_address(filter);
        !wanted.is_empty() && normalize_address(&self.address).contains(&wanted)
    }
}

/// Strips separators and case from a hardware address.
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn select_device(devices: &[BleDevice], filter: Option<&str>) -> Result<usize> {
    match filter {
        Some(filter) => devices
            .iter()
            .position(|d| d.matches(filter))
            .ok_or_else(|| Error::NoDevice {
                message: format!("no BLE radio matching {filter}"),
            }),
        None => match devices.len() {
            0 => Err(Error::NoDevice {
                message: "no BLE radios advertising".into(),
            }),
            1 => Ok(0),
            n => Err(Error::NoDevice {
                message: format!("{n} BLE radios advertising; pick one by name or address"),
            }),
        },
    }
}

async fn discover(scan_timeout: Duration) -> Result<Vec<(BleDevice, Peripheral)>> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoDevice {
            message: "no Bluetooth adapter".into(),
        })?;

    adapter
        .start_scan(ScanFilter {
            services: vec![SERVICE_UUID],
        })
        .await?;
    tokio::time::sleep(scan_timeout).await;
    let peripherals = adapter.peripherals().await?;
    if let Err(e) = adapter.stop_scan().await {
        debug!("stop scan: {}", e);
    }

    let mut found = Vec::new();
    for peripheral in peripherals {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        if !props.services.contains(&SERVICE_UUID) {
            continue;
        }
        let device = BleDevice {
            name: props.local_name,
            address: props.address.to_string(),
        };
        trace!(?device, "found radio");
        found.push((device, peripheral));
    }
    Ok(found)
}

/// Scans for advertising radios.
pub fn scan(timeout: Duration) -> Result<Vec<BleDevice>> {
    let bridge = AsyncBridge::with_timeouts(timeout + DEFAULT_RUN_TIMEOUT, DEFAULT_JOIN_TIMEOUT)?;
    let found = bridge.run_default(discover(timeout))?;
    bridge.close();
    Ok(found.into_iter().map(|(device, _)| device).collect())
}

/// What the pump hands to the reader side.
#[derive(Debug)]
enum FromDevice {
    Frame(Bytes),
    Log(String),
}

/// Turns a log characteristic notification into one console line.
fn log_line(uuid: Uuid, value: &[u8]) -> Option<String> {
    if uuid == LOGRADIO_UUID {
        match proto::LogRecord::decode(value) {
            Ok(record) if record.source.is_empty() => Some(record.message),
            Ok(record) => Some(format!("[{}] {}", record.source, record.message)),
            Err(e) => {
                debug!("undecodable LogRecord notification: {}", e);
                None
            }
        }
    } else if uuid == LEGACY_LOGRADIO_UUID {
        Some(String::from_utf8_lossy(value).replace('\n', ""))
    } else {
        None
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::transport(format!("characteristic {uuid} missing")))
}

/// Reads `FromRadio` until it is empty, forwarding each value as a frame.
async fn drain(
    peripheral: &Peripheral,
    from_radio: &Characteristic,
    inbound: &Sender<FromDevice>,
) -> Result<bool> {
    loop {
        let value = peripheral.read(from_radio).await?;
        if value.is_empty() {
            return Ok(true);
        }
        trace!("FromRadio: {} bytes", value.len());
        match encode_frame(&value) {
            Ok(frame) => {
                if inbound.send(FromDevice::Frame(frame)).is_err() {
                    return Ok(false);
                }
            }
            Err(e) => warn!("dropping FromRadio value: {}", e),
        }
    }
}

/// Moves data from the radio into the inbound channel until the link ends.
async fn pump(
    peripheral: Peripheral,
    from_radio: Characteristic,
    mut notifications: Notifications,
    mut kicks: async_mpsc::UnboundedReceiver<()>,
    inbound: Sender<FromDevice>,
) {
    loop {
        match drain(&peripheral, &from_radio, &inbound).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("FromRadio read failed: {}", e);
                return;
            }
        }

        // Log notifications are forwarded without draining FromRadio.
        loop {
            tokio::select! {
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        debug!("notification stream ended; device disconnected");
                        return;
                    };
                    let Some(line) = log_line(notification.uuid, &notification.value) else {
                        break;
                    };
                    if inbound.send(FromDevice::Log(line)).is_err() {
                        return;
                    }
                }
                kick = kicks.recv() => {
                    if kick.is_none() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

struct BleLink {
    bridge: AsyncBridge,
    peripheral: Peripheral,
    to_radio: Characteristic,
    kick: async_mpsc::UnboundedSender<()>,
}

/// BLE transport.
pub struct BleTransport {
    config: BleConfig,
    link: Mutex<Option<Arc<BleLink>>>,
    inbound: Mutex<Option<Receiver<FromDevice>>>,
    log_lines: Mutex<Vec<String>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Creates a BLE transport.
    #[must_use]
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            inbound: Mutex::new(None),
            log_lines: Mutex::new(Vec::new()),
        }
    }

    fn current_link(&self) -> Result<Arc<BleLink>> {
        self.link.lock().clone().ok_or(Error::NotConnected)
    }
}

impl Transport for BleTransport {
    fn open(&self) -> Result<()> {
        self.close()?;
        let timeout = self.config.operation_timeout;
        let bridge = AsyncBridge::with_timeouts(timeout, DEFAULT_JOIN_TIMEOUT)?;

        info!(device = ?self.config.device, "scanning for BLE radio");
        let mut found = bridge.run(
            discover(self.config.scan_timeout),
            self.config.scan_timeout + timeout,
        )?;
        let index = select_device(
            &found.iter().map(|(d, _)| d.clone()).collect::<Vec<_>>(),
            self.config.device.as_deref(),
        )?;
        let (device, peripheral) = found.swap_remove(index);
        info!(name = ?device.name, address = %device.address, "connecting to BLE radio");

        let setup = peripheral.clone();
        let connected = bridge.run(
            async move {
                setup.connect().await?;
                setup.discover_services().await?;
                let to_radio = characteristic(&setup, TORADIO_UUID)?;
                let from_radio = characteristic(&setup, FROMRADIO_UUID)?;
                let from_num = characteristic(&setup, FROMNUM_UUID)?;
                setup.subscribe(&from_num).await?;
                for uuid in [LEGACY_LOGRADIO_UUID, LOGRADIO_UUID] {
                    if let Ok(log) = characteristic(&setup, uuid) {
                        setup.subscribe(&log).await?;
                        debug!(%uuid, "subscribed to device log");
                    }
                }
                let notifications: Notifications = setup.notifications().await?;
                Ok((to_radio, from_radio, notifications))
            },
            timeout,
        );
        let (to_radio, from_radio, notifications) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                let teardown = peripheral.clone();
                if bridge.begin_close() {
                    let disconnected = bridge.run_cleanup(
                        async move { teardown.disconnect().await.map_err(Error::from) },
                        timeout,
                    );
                    if let Err(e) = disconnected {
                        warn!("BLE disconnect after failed setup: {}", e);
                    }
                    bridge.stop();
                }
                return Err(e);
            }
        };

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (kick_tx, kick_rx) = async_mpsc::unbounded_channel();
        bridge.spawn(pump(
            peripheral.clone(),
            from_radio,
            notifications,
            kick_rx,
            inbound_tx,
        ))?;

        *self.inbound.lock() = Some(inbound_rx);
        *self.link.lock() = Some(Arc::new(BleLink {
            bridge,
            peripheral,
            to_radio,
            kick: kick_tx,
        }));
        debug!("BLE link open");
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Bytes> {
        let inbound = self.inbound.lock().clone().ok_or(Error::NotConnected)?;
        match inbound.recv_timeout(timeout) {
            Ok(FromDevice::Frame(frame)) => Ok(frame),
            // Returning early lets the reader collect the line right away.
            Ok(FromDevice::Log(line)) => {
                self.log_lines.lock().push(line);
                Ok(Bytes::new())
            }
            Err(RecvTimeoutError::Timeout) => Ok(Bytes::new()),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionLost),
        }
    }

    fn take_log_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.log_lines.lock())
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        let link = self.current_link()?;
        let peripheral = link.peripheral.clone();
        let to_radio = link.to_radio.clone();
        let data = payload.to_vec();

        trace!("ToRadio: {} bytes", data.len());
        link.bridge.run(
            async move {
                peripheral
                    .write(&to_radio, &data, WriteType::WithResponse)
                    .await
                    .map_err(Error::from)
            },
            self.config.operation_timeout,
        )?;
        // Responses are queued on FromRadio right away.
        let _ = link.kick.send(());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let link = self.link.lock().take();
        if let Some(link) = link {
            if link.bridge.begin_close() {
                info!("closing BLE link");
                let peripheral = link.peripheral.clone();
                let disconnected = link.bridge.run_cleanup(
                    async move { peripheral.disconnect().await.map_err(Error::from) },
                    self.config.operation_timeout,
                );
                if let Err(e) = disconnected {
                    warn!("BLE disconnect failed: {}", e);
                }
                link.bridge.stop();
            }
            // The peripheral handle goes with the link whether or not disconnect worked.
            drop(link);
        }
        self.inbound.lock().take();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }
}
