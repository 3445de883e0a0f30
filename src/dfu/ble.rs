//! BLE transport over the DFU GATT service.
//!
//! Requests and responses travel on the control-point characteristic
//! (write-with-response out, notifications back); firmware fragments go
//! to the packet characteristic as write-without-response. The
//! underlying stack is async; this transport owns a small tokio runtime
//! and blocks on it so the protocol core stays synchronous.

use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info};
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::DfuTransport;
use crate::error::{Error, Result};

/// Short UUIDs under the Nordic vendor base UUID
/// `0000xxxx-1212-EFDE-1523-785FEABCD123`.
fn nordic_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_1212_EFDE_1523_785F_EABC_D123 | ((short as u128) << 96))
}

const DFU_CONTROL_POINT: u16 = 0x1531;
const DFU_PACKET: u16 = 0x1532;

const SCAN_POLL: Duration = Duration::from_millis(500);
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Packet-characteristic writes get no acknowledgement; a short pause
/// per write keeps slow peripherals from overrunning their buffer
/// between CRC checkpoints.
const WRITE_PACING: Duration = Duration::from_millis(1);

/// Default negotiated ATT MTU assumed when the platform does not expose
/// the real value.
const DEFAULT_ATT_MTU: u16 = 247;

/// How the peripheral to update is identified during the scan.
#[derive(Debug, Clone)]
pub enum BleTarget {
    /// Advertised local name, exact match.
    Name(String),
    /// Address formatted `AA:BB:CC:DD:EE:FF`, case-insensitive.
    Address(String),
}

struct OpenBle {
    peripheral: Peripheral,
    control_point: Characteristic,
    packet: Characteristic,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

pub struct BleTransport {
    runtime: Runtime,
    target: BleTarget,
    att_mtu: u16,
    scan_timeout: Duration,
    state: Option<OpenBle>,
}

impl BleTransport {
    pub fn new(target: BleTarget) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Ble(e.to_string()))?;
        Ok(Self {
            runtime,
            target,
            att_mtu: DEFAULT_ATT_MTU,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            state: None,
        })
    }

    /// Override the assumed ATT MTU when the link negotiates a
    /// different one.
    pub fn set_att_mtu(&mut self, att_mtu: u16) {
        self.att_mtu = att_mtu;
    }

    pub fn set_scan_timeout(&mut self, timeout: Duration) {
        self.scan_timeout = timeout;
    }

    fn matches(target: &BleTarget, name: Option<&str>, address: &str) -> bool {
        match target {
            BleTarget::Name(want) => name == Some(want.as_str()),
            BleTarget::Address(want) => want.eq_ignore_ascii_case(address),
        }
    }

    async fn adapter() -> Result<Adapter> {
        let manager = Manager::new().await.map_err(|e| Error::Ble(e.to_string()))?;
        manager
            .adapters()
            .await
            .map_err(|e| Error::Ble(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Ble("no bluetooth adapter".into()))
    }

    async fn scan(adapter: &Adapter, target: &BleTarget, timeout: Duration) -> Result<Peripheral> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::Ble(e.to_string()))?;

        let rounds = (timeout.as_millis() / SCAN_POLL.as_millis()).max(1);
        for _ in 0..rounds {
            tokio::time::sleep(SCAN_POLL).await;
            let peripherals = adapter
                .peripherals()
                .await
                .map_err(|e| Error::Ble(e.to_string()))?;
            for peripheral in peripherals {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let address = props.address.to_string();
                if Self::matches(target, props.local_name.as_deref(), &address) {
                    let _ = adapter.stop_scan().await;
                    info!(
                        "found {} ({address})",
                        props.local_name.as_deref().unwrap_or("<unnamed>")
                    );
                    return Ok(peripheral);
                }
            }
        }
        let _ = adapter.stop_scan().await;
        Err(Error::DeviceNotFound(format!("{target:?}")))
    }

    async fn connect(target: &BleTarget, scan_timeout: Duration) -> Result<OpenBle> {
        let adapter = Self::adapter().await?;
        let peripheral = Self::scan(&adapter, target, scan_timeout).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| Error::Ble(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Ble(e.to_string()))?;

        let find = |uuid: Uuid| -> Result<Characteristic> {
            peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == uuid)
                .ok_or_else(|| Error::Ble(format!("characteristic {uuid} not found")))
        };
        let control_point = find(nordic_uuid(DFU_CONTROL_POINT))?;
        let packet = find(nordic_uuid(DFU_PACKET))?;

        peripheral
            .subscribe(&control_point)
            .await
            .map_err(|e| Error::Ble(e.to_string()))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| Error::Ble(e.to_string()))?;

        Ok(OpenBle {
            peripheral,
            control_point,
            packet,
            notifications,
        })
    }

}

fn not_open() -> Error {
    Error::Operation("ble transport not open".into())
}

impl DfuTransport for BleTransport {
    fn open(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let target = self.target.clone();
        let scan_timeout = self.scan_timeout;
        let state = self
            .runtime
            .block_on(Self::connect(&target, scan_timeout))?;
        self.state = Some(state);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(state) = self.state.take() {
            let _ = self.runtime.block_on(state.peripheral.disconnect());
        }
    }

    /// Data fragments fit one ATT write: MTU minus the 3-byte ATT
    /// header.
    fn packet_size(&self) -> usize {
        self.att_mtu.saturating_sub(3) as usize
    }

    fn send_op(&mut self, frame: &[u8]) -> Result<()> {
        let state = self.state.as_mut().ok_or_else(not_open)?;
        let write = state
            .peripheral
            .write(&state.control_point, frame, WriteType::WithResponse);
        self.runtime
            .block_on(write)
            .map_err(|e| Error::Ble(e.to_string()))
    }

    fn recv_op(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let state = self.state.as_mut().ok_or_else(not_open)?;
        let control_uuid = state.control_point.uuid;
        let next = async {
            loop {
                match state.notifications.next().await {
                    Some(n) if n.uuid == control_uuid => return Some(n.value),
                    Some(n) => debug!("ignoring notification from {}", n.uuid),
                    None => return None,
                }
            }
        };
        match self.runtime.block_on(tokio::time::timeout(timeout, next)) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::Ble("notification stream closed".into())),
            Err(_) => Err(Error::OperationTimeout),
        }
    }

    fn stream_data(&mut self, fragment: &[u8]) -> Result<()> {
        let state = self.state.as_mut().ok_or_else(not_open)?;
        let write = state
            .peripheral
            .write(&state.packet, fragment, WriteType::WithoutResponse);
        self.runtime
            .block_on(write)
            .map_err(|e| Error::Ble(e.to_string()))?;
        std::thread::sleep(WRITE_PACING);
        Ok(())
    }
}
