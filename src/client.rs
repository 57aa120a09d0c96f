//! Equipment client: the connect handshake, the single-in-flight
//! request/response protocol, and the public read/write contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::{lookup_by_name, resolve, Command, SportsEquipment};
use crate::codec::{self, Reassembler, Write as CodecWrite};
use crate::equipment::EquipmentInformation;
use crate::error::{Error, Result};
use crate::transport::{CentralTransport, Notification, RX_CHARACTERISTIC, TX_CHARACTERISTIC};
use crate::value::Value;

/// Metadata characteristics read during connect step 7.
const BOUNDS_CHARACTERISTICS: &[&str] = &["MaxIncline", "MinIncline", "MaxKph", "MinKph", "MaxPulse", "Metric"];

/// The set the watch loop polls.
const WATCH_CHARACTERISTICS: &[&str] = &["Kph", "CurrentKph", "CurrentIncline", "Pulse", "Mode"];

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(200);
const SERVICE_STABILIZATION_DELAY: Duration = Duration::from_millis(600);
const ACTIVATION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between `send_request` (the writer) and the notification
/// task (the reader): the reassembly buffer and the waiter for whichever
/// request is currently in flight. At most one waiter exists at a time:
/// only one `send_request` call may be outstanding.
#[derive(Default)]
struct Inflight {
    reassembler: Reassembler,
    waiter: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

pub struct EquipmentClient {
    transport: Arc<dyn CentralTransport>,
    address: String,
    equipment: SportsEquipment,
    response_timeout: Duration,
    activation_code: Mutex<Option<[u8; 8]>>,
    info: RwLock<Option<EquipmentInformation>>,
    inflight: Arc<Mutex<Inflight>>,
    /// Serializes `send_request` calls end to end.
    request_gate: Mutex<()>,
    notifications_handle: Mutex<Option<JoinHandle<()>>>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    connected_since: Mutex<Option<Instant>>,
    last_request_at: Mutex<Option<Instant>>,
}

impl EquipmentClient {
    pub fn new(transport: Arc<dyn CentralTransport>, address: impl Into<String>, equipment: SportsEquipment) -> Self {
        Self {
            transport,
            address: address.into(),
            equipment,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            activation_code: Mutex::new(None),
            info: RwLock::new(None),
            inflight: Arc::new(Mutex::new(Inflight::default())),
            request_gate: Mutex::new(()),
            notifications_handle: Mutex::new(None),
            watch_handle: Mutex::new(None),
            connected: AtomicBool::new(false),
            connected_since: Mutex::new(None),
            last_request_at: Mutex::new(None),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Runs the full connect sequence.
    pub async fn connect(&self, activation_code: Option<[u8; 8]>) -> Result<()> {
        info!("Connecting to {}", self.address);
        self.transport.connect(&self.address).await?;

        tokio::time::sleep(SERVICE_STABILIZATION_DELAY).await;

        let services = self.transport.discover_services().await?;
        let normalized: Vec<String> = services.iter().map(crate::transport::normalize_uuid).collect();
        let rx_norm = crate::transport::normalize_uuid(&RX_CHARACTERISTIC);
        let tx_norm = crate::transport::normalize_uuid(&TX_CHARACTERISTIC);
        if !normalized.contains(&rx_norm) || !normalized.contains(&tx_norm) {
            return Err(Error::protocol("equipment does not expose the iFit RX/TX characteristics"));
        }

        let stream = self.transport.subscribe(RX_CHARACTERISTIC).await?;
        let handle = self.spawn_notification_task(stream);
        *self.notifications_handle.lock().await = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        *self.connected_since.lock().await = Some(Instant::now());

        if let Some(code) = activation_code {
            *self.activation_code.lock().await = Some(code);
        }

        let equipment_info_resp = self.send_raw(Command::EquipmentInformation, &[]).await?;
        let ids = codec::parse_equipment_information_bitmap(&equipment_info_resp)?;
        let mut info = EquipmentInformation::new(self.equipment, &ids);

        let capabilities_resp = self.send_raw(Command::SupportedCapabilities, &[]).await?;
        info.set_supported_capabilities(codec::parse_opcode_list(&capabilities_resp));

        let commands_resp = self.send_raw(Command::SupportedCommands, &[]).await?;
        info.set_supported_commands(codec::parse_opcode_list(&commands_resp));

        *self.info.write().await = Some(info);

        // Best-effort metadata queries: failures are logged and do not abort
        // connect.
        self.best_effort_metadata(Command::EquipmentReference).await;
        self.best_effort_metadata(Command::EquipmentFirmware).await;
        self.best_effort_metadata(Command::EquipmentSerial).await;

        if let Err(e) = self.read(BOUNDS_CHARACTERISTICS.iter().copied()).await {
            warn!("failed to read equipment bounds during connect: {e}");
        }

        if self.activation_code.lock().await.is_some() {
            self.enable().await?;
        }

        info!("Connected to {}", self.address);
        Ok(())
    }

    async fn best_effort_metadata(&self, command: Command) {
        let supported = {
            let guard = self.info.read().await;
            guard.as_ref().map(|i| i.supports_command(command as u8)).unwrap_or(false)
        };
        if !supported {
            debug!("{command:?} not in supported_commands, skipping");
            return;
        }
        let result = self.send_raw(command, &[0x00, 0x00]).await;
        let mut guard = self.info.write().await;
        let Some(info) = guard.as_mut() else { return };
        match (command, result) {
            (Command::EquipmentReference, Ok(resp)) => match codec::parse_reference(&resp) {
                Ok(r) => info.set_reference_number(r),
                Err(e) => warn!("failed to parse EQUIPMENT_REFERENCE: {e}"),
            },
            (Command::EquipmentFirmware, Ok(resp)) => info.set_firmware_version(codec::parse_firmware(&resp)),
            (Command::EquipmentSerial, Ok(resp)) => match codec::parse_serial(&resp) {
                Ok(s) => info.set_serial_number(s),
                Err(e) => warn!("failed to parse EQUIPMENT_SERIAL: {e}"),
            },
            (cmd, Err(e)) => warn!("best-effort metadata query {cmd:?} failed: {e}"),
            _ => unreachable!("best_effort_metadata only called with the three metadata commands"),
        }
    }

    async fn enable(&self) -> Result<()> {
        let code = *self.activation_code.lock().await;
        let Some(code) = code else { return Ok(()) };
        let resp = self.send_raw(Command::Enable, &code).await?;
        codec::check_status(&resp).map_err(|_| Error::activation("equipment rejected activation code"))?;
        Ok(())
    }

    fn spawn_notification_task(&self, mut stream: futures::stream::BoxStream<'static, Notification>) -> JoinHandle<()> {
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let mut guard = inflight.lock().await;
                if guard.waiter.is_none() {
                    // No request in flight: drop it.
                    continue;
                }
                match guard.reassembler.feed(&notification.data) {
                    Ok(Some(buffer)) => {
                        if let Some(tx) = guard.waiter.take() {
                            let _ = tx.send(Ok(buffer));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("reassembly error: {e}");
                        if let Some(tx) = guard.waiter.take() {
                            let _ = tx.send(Err(e));
                        }
                    }
                }
            }
        })
    }

    /// Sends one application request and awaits its response, enforcing the
    /// single-in-flight-request rule.
    async fn send_raw(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(Error::NotConnected("send_raw called before connect"));
        }
        let _gate = self.request_gate.lock().await;
        *self.last_request_at.lock().await = Some(Instant::now());

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inflight.lock().await;
            guard.reassembler.reset();
            guard.waiter = Some(tx);
        }

        let frame = codec::build_request(self.equipment, command, payload);
        debug!("-> {command:?} {} byte payload", payload.len());
        let messages = codec::build_write_messages(&frame);
        for message in &messages {
            self.transport.write_char(TX_CHARACTERISTIC, message).await?;
            tokio::time::sleep(INTER_CHUNK_DELAY).await;
        }

        let result = tokio::time::timeout(self.response_timeout, rx).await;
        match result {
            Ok(Ok(inner)) => {
                let resp = inner?;
                debug!("<- {command:?} {} byte response", resp.len());
                Ok(resp)
            }
            Ok(Err(_canceled)) => Err(Error::protocol("response channel dropped")),
            Err(_elapsed) => {
                let mut guard = self.inflight.lock().await;
                guard.waiter = None;
                Err(Error::Timeout(self.response_timeout))
            }
        }
    }

    /// Resolves each name against the catalog (an unknown name/id is an
    /// `InvalidArgument`), then silently drops ids the device doesn't
    /// advertise rather than erroring (spec §4.1.5: "Characteristics not
    /// present in `EquipmentInformation.characteristics` are silently
    /// dropped").
    fn supported_ids<'a>(&self, info: &EquipmentInformation, names: impl Iterator<Item = &'a str>) -> Result<Vec<u8>> {
        let mut ids = Vec::new();
        for name in names {
            let def = resolve(name)?;
            if info.characteristics().contains_key(&def.id) {
                ids.push(def.id);
            }
        }
        Ok(ids)
    }

    /// Issues a WRITE_AND_READ with the given writes and reads, returning the
    /// read values by name.
    pub async fn write_and_read<'a>(
        &self,
        writes: HashMap<&str, Value>,
        reads: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<String, Value>> {
        let guard = self.info.read().await;
        let info = guard.as_ref().ok_or(Error::NotConnected("equipment metadata not loaded"))?;

        let mut codec_writes: Vec<CodecWrite> = Vec::with_capacity(writes.len());
        for (name, value) in writes {
            let def = resolve(name)?;
            if info.characteristics().contains_key(&def.id) {
                codec_writes.push((def.id, value));
            }
        }

        let read_names: Vec<&str> = reads.into_iter().collect();
        let read_ids = self.supported_ids(info, read_names.iter().copied())?;
        drop(guard);

        let payload = codec::build_write_and_read_payload(&codec_writes, &read_ids)?;
        let resp = self.send_raw(Command::WriteAndRead, &payload).await?;
        codec::check_status(&resp)?;

        let guard = self.info.read().await;
        let info = guard.as_ref().ok_or(Error::NotConnected("equipment metadata not loaded"))?;
        let parsed = codec::parse_write_and_read_response(&resp, &read_ids, info.characteristics())?;
        drop(guard);

        let mut out = HashMap::with_capacity(parsed.len());
        let mut guard = self.info.write().await;
        let info = guard.as_mut().ok_or(Error::NotConnected("equipment metadata not loaded"))?;
        for (id, value) in parsed {
            info.record_value(id, value.clone());
            if let Some(def) = info.characteristics().get(&id) {
                out.insert(def.name.to_string(), value);
            }
        }
        Ok(out)
    }

    /// Reads the given characteristic names/ids.
    pub async fn read<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<HashMap<String, Value>> {
        self.write_and_read(HashMap::new(), names).await
    }

    /// Writes the given characteristic values.
    pub async fn write(&self, values: HashMap<&str, Value>) -> Result<()> {
        self.write_and_read(values, std::iter::empty()).await?;
        Ok(())
    }

    pub async fn set_speed(&self, kph: f64) -> Result<()> {
        let mut writes = HashMap::new();
        writes.insert("Kph", Value::Float(kph));
        self.write(writes).await
    }

    pub async fn set_incline(&self, percent: f64) -> Result<()> {
        let mut writes = HashMap::new();
        writes.insert("Incline", Value::Float(percent));
        self.write(writes).await
    }

    pub async fn calibrate(&self) -> Result<()> {
        let resp = self.send_raw(Command::Calibrate, &[0x00]).await?;
        codec::check_status(&resp)
    }

    /// Tries each `(code, model)` pair in turn until one activates the
    /// equipment, returning the matched code and model.
    pub async fn try_activation_codes(
        &self,
        codes: &[([u8; 8], String)],
        max_attempts: usize,
    ) -> Result<([u8; 8], String)> {
        let mut tried = 0;
        for (code, model) in codes.iter().take(max_attempts) {
            tried += 1;
            *self.activation_code.lock().await = Some(*code);
            if self.enable().await.is_err() {
                continue;
            }
            let probe = tokio::time::timeout(
                ACTIVATION_PROBE_TIMEOUT,
                self.read(["MaxIncline", "MinIncline"].into_iter()),
            )
            .await;
            if matches!(probe, Ok(Ok(_))) {
                return Ok((*code, model.clone()));
            }
        }
        *self.activation_code.lock().await = None;
        Err(Error::NoMatchingCode { tried })
    }

    /// Starts the background watch task if not already running; starting a
    /// second watch is a no-op with a warning.
    pub async fn watch<F>(self: &Arc<Self>, interval: Duration, mut callback: F)
    where
        F: FnMut(&HashMap<String, Value>) + Send + 'static,
    {
        let mut guard = self.watch_handle.lock().await;
        if guard.is_some() {
            warn!("watch already running, ignoring duplicate start");
            return;
        }
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !client.is_connected() {
                    info!("watch loop exiting: link is down");
                    break;
                }
                match client.read(WATCH_CHARACTERISTICS.iter().copied()).await {
                    Ok(values) => callback(&values),
                    Err(e) => warn!("watch read failed: {e}"),
                }
            }
        });
        *guard = Some(handle);
    }

    /// Stops the watch task; idempotent.
    pub async fn stop_watch(&self) {
        if let Some(handle) = self.watch_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Disconnects, stopping the watch task and closing the link. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_watch().await;
        if let Some(handle) = self.notifications_handle.lock().await.take() {
            handle.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.transport.disconnect().await?;
        }
        *self.connected_since.lock().await = None;
        Ok(())
    }

    pub async fn info(&self) -> Option<EquipmentInformation> {
        self.info.read().await.clone()
    }

    /// When the current connection was established, if any (SPEC_FULL.md
    /// §4.2 supplement).
    pub async fn connected_since(&self) -> Option<Instant> {
        *self.connected_since.lock().await
    }

    /// When the last `send_raw` request was issued, if any.
    pub async fn last_request_at(&self) -> Option<Instant> {
        *self.last_request_at.lock().await
    }

    pub fn lookup(&self, name: &str) -> Option<&'static crate::catalog::CharacteristicDefinition> {
        lookup_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockCentral;
    use std::sync::Arc;

    fn equipment_info_response() -> Vec<u8> {
        // Advertises ids 0,1,16,27,28,30,31,49,36 so the bounds read + a
        // couple of writable characteristics are available.
        let ids: &[u8] = &[0, 1, 16, 27, 28, 30, 31, 36, 49];
        let bitmap = codec::encode_bitmap(ids);
        let mut resp = vec![0u8; 17];
        resp[16] = bitmap[0];
        resp.extend_from_slice(&bitmap[1..]);
        finalize_response(resp)
    }

    fn finalize_response(mut resp: Vec<u8>) -> Vec<u8> {
        resp[3] = (resp.len() - 4) as u8;
        resp[7] = 0x02;
        let sum: u32 = resp[4..resp.len() - 1].iter().map(|&b| b as u32).sum();
        *resp.last_mut().unwrap() = (sum & 0xFF) as u8;
        resp
    }

    fn base_response(len: usize) -> Vec<u8> {
        let mut resp = vec![0u8; len];
        resp[0] = 0x02;
        resp[1] = 0x04;
        resp[2] = 0x02;
        resp[4] = SportsEquipment::Treadmill as u8;
        resp[5] = (len - 4) as u8;
        resp
    }

    async fn feed(mock: &MockCentral, response: &[u8]) {
        let messages = codec::build_write_messages(response);
        for message in messages {
            mock.push_notification(RX_CHARACTERISTIC, message);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn connect_populates_equipment_metadata() {
        let mock = Arc::new(MockCentral::new());
        let client = Arc::new(EquipmentClient::new(mock.clone(), "AA:BB", SportsEquipment::Treadmill));

        let client2 = Arc::clone(&client);
        let mock2 = Arc::clone(&mock);
        let driver = tokio::spawn(async move {
            // EQUIPMENT_INFORMATION
            feed(&mock2, &equipment_info_response()).await;
            // SUPPORTED_CAPABILITIES
            feed(&mock2, &finalize_response(base_response(10))).await;
            // SUPPORTED_COMMANDS
            feed(&mock2, &finalize_response(base_response(10))).await;
            // bounds read (WRITE_AND_READ): MaxIncline(27) MinIncline(28) MaxKph(30) MinKph(31) MaxPulse(49) Metric(36)
            let mut resp = base_response(8);
            resp.extend_from_slice(&[0x0E, 0x00][..0]); // placeholder no-op
            let mut body = vec![0u8; 2 + 2 + 2 + 2 + 1 + 1]; // doubles are 2 bytes, MaxPulse 1 byte, Metric 1 byte
            body[0..2].copy_from_slice(&[0x90, 0x01]); // MaxIncline 4.0
            body[2..4].copy_from_slice(&[0x00, 0x00]); // MinIncline 0.0
            body[4..6].copy_from_slice(&[0x40, 0x1F]); // MaxKph 80.0
            body[6..8].copy_from_slice(&[0x00, 0x00]); // MinKph 0.0
            body[8] = 200; // MaxPulse
            body[9] = 1; // Metric true
            resp.extend_from_slice(&body);
            feed(&mock2, &finalize_response(resp)).await;
            client2
        });

        client.connect(None).await.unwrap();
        driver.await.unwrap();

        let info = client.info().await.unwrap();
        assert!(info.characteristics().contains_key(&30));
        assert_eq!(info.value("MaxKph"), Some(&Value::Float(80.0)));
    }

    #[tokio::test]
    async fn send_raw_rejects_use_before_connect() {
        let mock = Arc::new(MockCentral::new());
        let client = EquipmentClient::new(mock, "AA:BB", SportsEquipment::Treadmill);
        let err = client.calibrate().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn supported_ids_silently_drops_unadvertised_characteristics() {
        let mock = Arc::new(MockCentral::new());
        let client = EquipmentClient::new(mock, "AA:BB", SportsEquipment::Treadmill);
        // Only MaxKph (30) is advertised; MinKph (31) is catalog-known but
        // not on this device and should be dropped, not rejected.
        let info = EquipmentInformation::new(SportsEquipment::Treadmill, &[30]);
        let ids = client.supported_ids(&info, ["MaxKph", "MinKph"].into_iter()).unwrap();
        assert_eq!(ids, vec![30]);
    }

    #[tokio::test]
    async fn supported_ids_still_rejects_unknown_names() {
        let mock = Arc::new(MockCentral::new());
        let client = EquipmentClient::new(mock, "AA:BB", SportsEquipment::Treadmill);
        let info = EquipmentInformation::new(SportsEquipment::Treadmill, &[30]);
        let err = client.supported_ids(&info, ["NotACharacteristic"].into_iter()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
