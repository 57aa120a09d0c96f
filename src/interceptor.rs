//! Man-in-the-middle interceptor: bridges the vendor app (peripheral role,
//! toward us) and the real equipment (central role), reassembling the app's
//! writes, re-framing them, and capturing the `ENABLE` activation payload.
//!
//! The two BLE roles are modeled as independent tasks exchanging no shared
//! mutable state directly, communicating instead by message passing. The
//! per-request assembly state lives only inside the peripheral-write task;
//! the central-notify pump only ever forwards bytes verbatim.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::catalog::{Command, SportsEquipment};
use crate::codec;
use crate::error::{Error, Result};
use crate::persist::{CodeEntry, CodeSink};
use crate::transport::{
    CentralTransport, CharacteristicProperties, PeripheralTransport, RX_CHARACTERISTIC, SERVICE_UUID, TX_CHARACTERISTIC,
};

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(200);

/// One fully reassembled app -> equipment request.
#[derive(Debug, Clone)]
struct AppRequest {
    device: u8,
    command: u8,
    payload: Vec<u8>,
}

/// Per-in-flight-request assembly state, mutated only by the
/// peripheral-write task.
#[derive(Default)]
struct PendingRequest {
    buffer: Vec<u8>,
    expected_len: usize,
    command: Option<u8>,
    device: Option<u8>,
}

impl PendingRequest {
    fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
        self.command = None;
        self.device = None;
    }

    /// Feeds one raw write from the vendor app's TX characteristic. Returns
    /// `Some(request)` once the message-complete trigger fires with both a
    /// device and a command captured; a trigger without either is a partial
    /// buffer and is discarded.
    fn feed(&mut self, message: &[u8]) -> Option<AppRequest> {
        if message.is_empty() {
            return None;
        }
        let index = message[0];
        let mut complete = false;

        match index {
            0xFE => {
                self.reset();
                if message.len() > 2 {
                    self.expected_len = message[2] as usize;
                }
                return None;
            }
            0x00 => {
                if message.len() > 8 {
                    self.device = Some(message[6]);
                    self.command = Some(message[8]);
                }
                if message.len() > 9 {
                    let length = message[1] as usize;
                    let end = (9 + length).min(message.len());
                    self.buffer.extend_from_slice(&message[9..end]);
                }
                complete = message.len() < 20;
            }
            0xFF => {
                if self.command.is_none() && message.len() > 8 {
                    self.command = Some(message[8]);
                }
                complete = true;
            }
            _ => {
                if message.len() > 2 {
                    let length = message[1] as usize;
                    let end = (2 + length).min(message.len());
                    self.buffer.extend_from_slice(&message[2..end]);
                }
            }
        }

        if !complete {
            return None;
        }
        let request = match (self.device, self.command) {
            (Some(device), Some(command)) => Some(AppRequest {
                device,
                command,
                payload: std::mem::take(&mut self.buffer),
            }),
            _ => {
                warn!("discarding partial app request (device/command not captured)");
                None
            }
        };
        self.reset();
        request
    }
}

/// The captured 8-byte `ENABLE` payload, hex-encoded for display/storage.
#[derive(Debug, Clone)]
pub struct CapturedActivation {
    pub payload: Vec<u8>,
    pub hex: String,
}

pub struct Interceptor {
    central: Arc<dyn CentralTransport>,
    peripheral: Arc<dyn PeripheralTransport>,
    equipment_address: String,
    ble_code: String,
    code_sink: Arc<dyn CodeSink>,
    discovery_timeout: Duration,
}

impl Interceptor {
    pub fn new(
        central: Arc<dyn CentralTransport>,
        peripheral: Arc<dyn PeripheralTransport>,
        equipment_address: impl Into<String>,
        ble_code: impl Into<String>,
        code_sink: Arc<dyn CodeSink>,
    ) -> Self {
        Self {
            central,
            peripheral,
            equipment_address: equipment_address.into(),
            ble_code: ble_code.into(),
            code_sink,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Runs the bridge until an `ENABLE` command has been captured or the
    /// discovery timeout elapses.
    pub async fn run(self) -> Result<CapturedActivation> {
        self.central.connect(&self.equipment_address).await?;
        let equipment_notifications = self.central.subscribe(RX_CHARACTERISTIC).await?;

        self.peripheral.add_service(SERVICE_UUID).await?;
        self.peripheral
            .add_characteristic(
                SERVICE_UUID,
                RX_CHARACTERISTIC,
                CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            )
            .await?;
        self.peripheral
            .add_characteristic(
                SERVICE_UUID,
                TX_CHARACTERISTIC,
                CharacteristicProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            )
            .await?;

        let (app_write_tx, app_write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.peripheral
            .set_write_handler(
                SERVICE_UUID,
                TX_CHARACTERISTIC,
                Box::new(move |data| {
                    // Never awaits: just hands bytes to the
                    // peripheral-write task's channel.
                    let _ = app_write_tx.send(data);
                }),
            )
            .await?;

        let manufacturer_data = crate::discovery::suffix_for_code(&self.ble_code)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        self.peripheral
            .start_advertising(manufacturer_data, vec![SERVICE_UUID])
            .await?;

        let (done_tx, done_rx) = oneshot::channel();

        let pump_peripheral = Arc::clone(&self.peripheral);
        let notify_pump = tokio::spawn(Self::run_notify_pump(equipment_notifications, pump_peripheral));

        let central = Arc::clone(&self.central);
        let code_sink = Arc::clone(&self.code_sink);
        let equipment_address = self.equipment_address.clone();
        let ble_code = self.ble_code.clone();
        let write_task = tokio::spawn(Self::run_write_handler(
            app_write_rx,
            central,
            code_sink,
            equipment_address,
            ble_code,
            done_tx,
        ));

        let result = tokio::time::timeout(self.discovery_timeout, done_rx).await;
        notify_pump.abort();
        write_task.abort();

        match result {
            Ok(Ok(captured)) => Ok(captured),
            Ok(Err(_canceled)) => Err(Error::protocol("capture task ended without a result")),
            Err(_elapsed) => Err(Error::Timeout(self.discovery_timeout)),
        }
    }

    async fn run_notify_pump(
        mut equipment_notifications: futures::stream::BoxStream<'static, crate::transport::Notification>,
        peripheral: Arc<dyn PeripheralTransport>,
    ) {
        while let Some(notification) = equipment_notifications.next().await {
            if let Err(e) = peripheral.update_value(SERVICE_UUID, RX_CHARACTERISTIC, &notification.data).await {
                error!("failed to relay equipment notification to app: {e}");
            }
        }
    }

    async fn run_write_handler(
        mut app_write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        central: Arc<dyn CentralTransport>,
        code_sink: Arc<dyn CodeSink>,
        equipment_address: String,
        ble_code: String,
        done_tx: oneshot::Sender<CapturedActivation>,
    ) {
        let mut pending = PendingRequest::default();
        let mut done_tx = Some(done_tx);

        while let Some(message) = app_write_rx.recv().await {
            let Some(request) = pending.feed(&message) else {
                continue;
            };

            if request.command == Command::Enable as u8 {
                let hex = request.payload.iter().map(|b| format!("{b:02X}")).collect::<String>();
                info!("captured ENABLE activation payload {hex}");
                if let Err(e) = code_sink
                    .record(CodeEntry {
                        ble_code: ble_code.clone(),
                        address: equipment_address.clone(),
                        activation_code: hex.clone(),
                    })
                    .await
                {
                    warn!("failed to persist captured activation code: {e}");
                }
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(CapturedActivation {
                        payload: request.payload.clone(),
                        hex,
                    });
                }
            }

            let Some(equipment): Option<SportsEquipment> = num_traits::FromPrimitive::from_u8(request.device) else {
                warn!("unknown device byte {:#04x} in captured app request, dropping forward", request.device);
                continue;
            };
            let Some(command): Option<Command> = num_traits::FromPrimitive::from_u8(request.command) else {
                warn!("unknown command byte {:#04x} in captured app request, dropping forward", request.command);
                continue;
            };

            let frame = codec::build_request(equipment, command, &request.payload);
            for chunk in codec::build_write_messages(&frame) {
                if let Err(e) = central.write_char(TX_CHARACTERISTIC, &chunk).await {
                    error!("failed to forward re-framed request to equipment: {e}");
                    break;
                }
                tokio::time::sleep(INTER_CHUNK_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u8, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![index, data.len() as u8];
        msg.extend_from_slice(data);
        msg
    }

    #[test]
    fn captures_enable_from_header_first_eof_sequence() {
        let mut pending = PendingRequest::default();
        assert!(pending.feed(&[0xFE, 0x02, 0x10, 0x03]).is_none());

        // first chunk: bytes 2..9 are opaque frame header fields, byte 6 =
        // device, byte 8 = command, payload follows at byte 9.
        let mut first = vec![0x00u8, 0x08, 0, 0, 0, 0, 0x04, 0, 0x90];
        first.extend_from_slice(&[0x07, 0x01, 0x62, 0x5C, 0x00, 0xE4, 0x3A, 0x16]);
        assert!(pending.feed(&first).is_none());

        let request = pending.feed(&[0xFF, 0x00]).unwrap();
        assert_eq!(request.device, 0x04);
        assert_eq!(request.command, Command::Enable as u8);
        assert_eq!(request.payload, vec![0x07, 0x01, 0x62, 0x5C, 0x00, 0xE4, 0x3A, 0x16]);
    }

    #[test]
    fn short_index_zero_chunk_completes_without_eof() {
        let mut pending = PendingRequest::default();
        let mut msg = vec![0x00u8, 0x01, 0, 0, 0, 0, 0x04, 0, 0x06];
        msg.push(0x00);
        assert!(msg.len() < 20);
        let request = pending.feed(&msg).unwrap();
        assert_eq!(request.command, Command::Calibrate as u8);
        assert_eq!(request.payload, vec![0x00]);
    }

    #[test]
    fn continuation_chunk_appends_before_eof() {
        let mut pending = PendingRequest::default();
        pending.feed(&[0xFE, 0x02, 0x20, 0x04]);
        let mut first = vec![0x00u8, 0x02, 0, 0, 0, 0, 0x04, 0, 0x02];
        first.extend_from_slice(&[0xAA, 0xBB]);
        pending.feed(&first);
        let cont = chunk(1, &[0xCC, 0xDD]);
        assert!(pending.feed(&cont).is_none());
        let request = pending.feed(&[0xFF, 0x00]).unwrap();
        assert_eq!(request.payload, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn partial_capture_without_device_is_discarded() {
        let mut pending = PendingRequest::default();
        pending.feed(&[0xFE, 0x02, 0x10, 0x02]);
        // EOF arrives with no preceding 0x00 chunk: command may be
        // best-effort captured but device never is.
        assert!(pending.feed(&[0xFF, 0x00, 0, 0, 0, 0, 0, 0, 0x90]).is_none());
    }
}
