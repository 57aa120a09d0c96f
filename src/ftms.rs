//! FTMS relay: pumps cached equipment values into Fitness Machine Service
//! Treadmill Data notifications and translates control-point writes into
//! client writes.
//!
//! The wire-encoding constants follow the Bluetooth SIG Fitness Machine
//! Service layout; this module applies the same flag-bit/optional-field
//! pattern to *encoding* Treadmill Data rather than decoding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use btleplug::api::bleuuid::uuid_from_u16;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::catalog::Mode;
use crate::client::EquipmentClient;
use crate::error::Result;
use crate::transport::{CharacteristicProperties, PeripheralTransport};
use crate::value::{PulseSource, Value};

pub const SERVICE_UUID: Uuid = uuid_from_u16(0x1826);
pub const TREADMILL_DATA: Uuid = uuid_from_u16(0x2ACD);
pub const FITNESS_MACHINE_STATUS: Uuid = uuid_from_u16(0x2ADA);
pub const CONTROL_POINT: Uuid = uuid_from_u16(0x2AD9);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlPointOpCode {
    RequestControl = 0x00,
    SetTargetSpeed = 0x02,
    SetTargetIncline = 0x03,
    StartOrResume = 0x07,
    StopOrPause = 0x08,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlPointResult {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
}

/// Machine-status opcodes the relay emits on a `Mode` transition; the same
/// SIG status-opcode table used for the Fitness Machine Status
/// characteristic regardless of machine type.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MachineStatusOpCode {
    Reset = 0x01,
    StoppedPausedByUser = 0x02,
    StoppedBySafetyKey = 0x03,
    StartedResumedByUser = 0x04,
}

fn machine_status_for_mode(mode: Mode) -> Option<MachineStatusOpCode> {
    match mode {
        Mode::Idle => Some(MachineStatusOpCode::Reset),
        Mode::Active => Some(MachineStatusOpCode::StartedResumedByUser),
        Mode::Pause => Some(MachineStatusOpCode::StoppedPausedByUser),
        Mode::MissingSafetyKey => Some(MachineStatusOpCode::StoppedBySafetyKey),
        _ => None,
    }
}

const CURRENT_VALUES: &[&str] = &["CurrentKph", "CurrentIncline", "Distance", "Pulse", "Mode"];

/// Encodes the cached current-values set as an FTMS Treadmill Data
/// notification: flags word, instantaneous speed always present, then
/// distance/inclination/heart-rate in SIG field order when available.
pub fn encode_treadmill_data(values: &HashMap<String, Value>) -> Vec<u8> {
    let kph = values.get("CurrentKph").and_then(|v| v.as_f64().ok()).unwrap_or(0.0);
    let distance = values.get("Distance").and_then(|v| v.as_i64().ok());
    let incline = values.get("CurrentIncline").and_then(|v| v.as_f64().ok());
    let heart_rate = values.get("Pulse").and_then(|v| v.as_pulse().ok()).and_then(|(pulse, _, _, source)| {
        (source != PulseSource::No).then_some(pulse)
    });

    let mut flags: u16 = 0;
    if distance.is_some() {
        flags |= 1 << 2;
    }
    if incline.is_some() {
        flags |= 1 << 3;
    }
    if heart_rate.is_some() {
        flags |= 1 << 8;
    }

    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&((kph * 100.0).round() as u16).to_le_bytes());

    if let Some(distance) = distance {
        let mut buf = [0u8; 3];
        LittleEndian::write_uint(&mut buf, distance.max(0) as u64, 3);
        body.extend_from_slice(&buf);
    }
    if let Some(incline) = incline {
        body.extend_from_slice(&((incline * 10.0).round() as i16).to_le_bytes());
    }
    if let Some(hr) = heart_rate {
        body.push(hr);
    }

    body
}

struct Bounds {
    min_kph: f64,
    max_kph: f64,
    min_incline: f64,
    max_incline: f64,
}

impl Bounds {
    async fn from_client(client: &EquipmentClient) -> Self {
        let info = client.info().await;
        let get = |name: &str| info.as_ref().and_then(|i| i.value(name)).and_then(|v| v.as_f64().ok());
        Self {
            min_kph: get("MinKph").unwrap_or(0.0),
            max_kph: get("MaxKph").unwrap_or(f64::MAX),
            min_incline: get("MinIncline").unwrap_or(f64::MIN),
            max_incline: get("MaxIncline").unwrap_or(f64::MAX),
        }
    }
}

pub struct FtmsRelay {
    client: Arc<EquipmentClient>,
    peripheral: Arc<dyn PeripheralTransport>,
    poll_interval: Duration,
}

impl FtmsRelay {
    pub fn new(client: Arc<EquipmentClient>, peripheral: Arc<dyn PeripheralTransport>) -> Self {
        Self {
            client,
            peripheral,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets up the FTMS GATT surface and spawns the poll loop and
    /// control-point dispatch tasks. Returns once both are running; the
    /// caller keeps the returned handles alive for the relay's lifetime.
    pub async fn run(self) -> Result<FtmsRelayHandles> {
        self.peripheral.add_service(SERVICE_UUID).await?;
        self.peripheral
            .add_characteristic(
                SERVICE_UUID,
                TREADMILL_DATA,
                CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            )
            .await?;
        self.peripheral
            .add_characteristic(
                SERVICE_UUID,
                FITNESS_MACHINE_STATUS,
                CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            )
            .await?;
        self.peripheral
            .add_characteristic(
                SERVICE_UUID,
                CONTROL_POINT,
                CharacteristicProperties {
                    write: true,
                    indicate: true,
                    ..Default::default()
                },
            )
            .await?;

        let bounds = Arc::new(Bounds::from_client(&self.client).await);

        let (cp_tx, cp_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.peripheral
            .set_write_handler(
                SERVICE_UUID,
                CONTROL_POINT,
                Box::new(move |data| {
                    let _ = cp_tx.send(data);
                }),
            )
            .await?;

        let last_mode: Arc<AtomicU8> = Arc::new(AtomicU8::new(Mode::Unknown as u8));

        let poll_client = Arc::clone(&self.client);
        let poll_peripheral = Arc::clone(&self.peripheral);
        let poll_last_mode = Arc::clone(&last_mode);
        let poll_interval = self.poll_interval;
        let poll_handle = tokio::spawn(async move {
            Self::run_poll_loop(poll_client, poll_peripheral, poll_last_mode, poll_interval).await;
        });

        let cp_client = Arc::clone(&self.client);
        let cp_peripheral = Arc::clone(&self.peripheral);
        let control_point_handle = tokio::spawn(Self::run_control_point(cp_rx, cp_client, cp_peripheral, bounds));

        Ok(FtmsRelayHandles {
            poll_handle,
            control_point_handle,
        })
    }

    async fn run_poll_loop(
        client: Arc<EquipmentClient>,
        peripheral: Arc<dyn PeripheralTransport>,
        last_mode: Arc<AtomicU8>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !client.is_connected() {
                info!("FTMS relay poll loop exiting: link is down");
                break;
            }
            let values = match client.read(CURRENT_VALUES.iter().copied()).await {
                Ok(values) => values,
                Err(e) => {
                    warn!("FTMS relay poll read failed: {e}");
                    continue;
                }
            };

            let data = encode_treadmill_data(&values);
            if let Err(e) = peripheral.update_value(SERVICE_UUID, TREADMILL_DATA, &data).await {
                warn!("FTMS relay failed to notify Treadmill Data: {e}");
            }

            if let Some(Value::Mode(mode)) = values.get("Mode") {
                let previous = Mode::from_u8(last_mode.load(Ordering::SeqCst));
                if previous != Some(*mode) {
                    last_mode.store(*mode as u8, Ordering::SeqCst);
                    if let Some(opcode) = machine_status_for_mode(*mode) {
                        if let Err(e) = peripheral
                            .update_value(SERVICE_UUID, FITNESS_MACHINE_STATUS, &[opcode as u8])
                            .await
                        {
                            warn!("FTMS relay failed to notify Fitness Machine Status: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn run_control_point(
        mut cp_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        client: Arc<EquipmentClient>,
        peripheral: Arc<dyn PeripheralTransport>,
        bounds: Arc<Bounds>,
    ) {
        while let Some(data) = cp_rx.recv().await {
            if data.is_empty() {
                continue;
            }
            let op_code = data[0];
            let (result, client_write): (ControlPointResult, Option<ClientWrite>) = match ControlPointOpCode::from_u8(op_code) {
                Some(ControlPointOpCode::RequestControl) => (ControlPointResult::Success, None),
                Some(ControlPointOpCode::SetTargetSpeed) => {
                    if data.len() < 3 {
                        (ControlPointResult::InvalidParameter, None)
                    } else {
                        let kph = LittleEndian::read_u16(&data[1..3]) as f64 / 100.0;
                        if kph < bounds.min_kph || kph > bounds.max_kph {
                            (ControlPointResult::InvalidParameter, None)
                        } else {
                            (ControlPointResult::Success, Some(ClientWrite::Speed(kph)))
                        }
                    }
                }
                Some(ControlPointOpCode::SetTargetIncline) => {
                    if data.len() < 3 {
                        (ControlPointResult::InvalidParameter, None)
                    } else {
                        let incline = LittleEndian::read_i16(&data[1..3]) as f64 / 10.0;
                        if incline < bounds.min_incline || incline > bounds.max_incline {
                            (ControlPointResult::InvalidParameter, None)
                        } else {
                            (ControlPointResult::Success, Some(ClientWrite::Incline(incline)))
                        }
                    }
                }
                Some(ControlPointOpCode::StartOrResume) | Some(ControlPointOpCode::StopOrPause) => {
                    (ControlPointResult::OpCodeNotSupported, None)
                }
                None => (ControlPointResult::OpCodeNotSupported, None),
            };

            let response = [0x80, op_code, result as u8];
            if let Err(e) = peripheral.update_value(SERVICE_UUID, CONTROL_POINT, &response).await {
                warn!("FTMS relay failed to send control point response: {e}");
            }

            if let Some(write) = client_write {
                // Dispatched as a background task; failures are logged, not
                // propagated into the BLE write handler.
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let result = match write {
                        ClientWrite::Speed(kph) => client.set_speed(kph).await,
                        ClientWrite::Incline(incline) => client.set_incline(incline).await,
                    };
                    if let Err(e) = result {
                        error!("FTMS relay control-point write failed: {e}");
                    }
                });
            }
        }
    }
}

enum ClientWrite {
    Speed(f64),
    Incline(f64),
}

pub struct FtmsRelayHandles {
    pub poll_handle: tokio::task::JoinHandle<()>,
    pub control_point_handle: tokio::task::JoinHandle<()>,
}

impl FtmsRelayHandles {
    /// Idempotent shutdown.
    pub fn stop(self) {
        self.poll_handle.abort();
        self.control_point_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_speed_only_when_no_optional_fields_present() {
        let mut values = HashMap::new();
        values.insert("CurrentKph".to_string(), Value::Float(8.0));
        let data = encode_treadmill_data(&values);
        assert_eq!(data, vec![0x00, 0x00, 0x20, 0x03]);
    }

    #[test]
    fn encodes_distance_incline_and_heart_rate_when_present() {
        let mut values = HashMap::new();
        values.insert("CurrentKph".to_string(), Value::Float(8.0));
        values.insert("Distance".to_string(), Value::Integer(1234));
        values.insert("CurrentIncline".to_string(), Value::Float(3.5));
        values.insert(
            "Pulse".to_string(),
            Value::Pulse {
                pulse: 130,
                average: 128,
                count: 0,
                source: PulseSource::Ble,
            },
        );
        let data = encode_treadmill_data(&values);
        let flags = u16::from_le_bytes([data[0], data[1]]);
        assert_eq!(flags, (1 << 2) | (1 << 3) | (1 << 8));
        assert_eq!(&data[2..4], &[0x20, 0x03]);
        let mut distance_buf = [0u8; 4];
        distance_buf[..3].copy_from_slice(&data[4..7]);
        assert_eq!(u32::from_le_bytes(distance_buf), 1234);
        assert_eq!(i16::from_le_bytes([data[7], data[8]]), 35);
        assert_eq!(data[9], 130);
    }

    #[test]
    fn heart_rate_omitted_when_pulse_source_is_no() {
        let mut values = HashMap::new();
        values.insert("CurrentKph".to_string(), Value::Float(8.0));
        values.insert(
            "Pulse".to_string(),
            Value::Pulse {
                pulse: 0,
                average: 0,
                count: 0,
                source: PulseSource::No,
            },
        );
        let data = encode_treadmill_data(&values);
        assert_eq!(data.len(), 4);
    }
}
