//! BLE capability traits. The equipment client, interceptor, and FTMS
//! relay are all written against these two traits rather than directly
//! against `btleplug`, mirroring how `btleplug` itself splits
//! `Central`/`Peripheral` traits from their platform-specific
//! implementation, so each can be driven by a deterministic mock in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// The iFit GATT service and characteristic UUIDs, bit-exact.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1533_1412_efde_1523_785f_eabc_d123);
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_1535_1412_efde_1523_785f_eabc_d123);
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_1534_1412_efde_1523_785f_eabc_d123);

/// Strips dashes so UUIDs can be compared the way equipment firmware
/// reports them (some advertise without hyphens).
pub fn normalize_uuid(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// A single fragment delivered by a BLE notification/indication.
#[derive(Debug, Clone)]
pub struct Notification {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

/// Capability surface required of a BLE central role (client and
/// interceptor-towards-equipment).
#[async_trait]
pub trait CentralTransport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<()>;
    async fn discover_services(&self) -> Result<Vec<Uuid>>;
    async fn write_char(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;
    /// Returns a stream of notifications for all subscribed characteristics;
    /// callers filter by `Notification::characteristic`.
    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Notification>>;
    async fn disconnect(&self) -> Result<()>;
}

/// Capability surface required of a BLE peripheral role (interceptor and
/// FTMS relay, both acting as a GATT server).
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    async fn add_service(&self, service: Uuid) -> Result<()>;
    async fn add_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        properties: CharacteristicProperties,
    ) -> Result<()>;
    async fn update_value(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;
    async fn start_advertising(&self, manufacturer_data: Vec<u8>, service_uuids: Vec<Uuid>) -> Result<()>;
    /// Registers the callback invoked when the vendor app writes to
    /// `characteristic`; the transport calls this synchronously as writes
    /// arrive; the notification handler never awaits.
    async fn set_write_handler(
        &self,
        service: Uuid,
        characteristic: Uuid,
        handler: Box<dyn Fn(Vec<u8>) + Send + Sync>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock {
    //! A deterministic in-memory `CentralTransport` for tests: the test
    //! drives the notification stream directly instead of a real radio.

    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    pub struct MockCentral {
        pub written: std::sync::Mutex<Vec<(Uuid, Vec<u8>)>>,
        notify_tx: mpsc::UnboundedSender<Notification>,
        notify_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    }

    impl MockCentral {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                written: std::sync::Mutex::new(Vec::new()),
                notify_tx: tx,
                notify_rx: std::sync::Mutex::new(Some(rx)),
            }
        }

        /// Pushes a fake notification as if it arrived from the equipment.
        pub fn push_notification(&self, characteristic: Uuid, data: Vec<u8>) {
            let _ = self.notify_tx.send(Notification { characteristic, data });
        }

        pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
            self.written.lock().unwrap().clone()
        }
    }

    impl Default for MockCentral {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl CentralTransport for MockCentral {
        async fn connect(&self, _address: &str) -> Result<()> {
            Ok(())
        }

        async fn discover_services(&self) -> Result<Vec<Uuid>> {
            // Flattened characteristic UUIDs, mirroring what a real
            // `discover_services()` yields once service discovery walks
            // down to each characteristic (`_client.py`'s
            // `available_uuids`), not the service UUID itself.
            Ok(vec![RX_CHARACTERISTIC, TX_CHARACTERISTIC])
        }

        async fn write_char(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
            self.written.lock().unwrap().push((characteristic, data.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, _characteristic: Uuid) -> Result<BoxStream<'static, Notification>> {
            let rx = self
                .notify_rx
                .lock()
                .unwrap()
                .take()
                .expect("MockCentral::subscribe called twice");
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }
}
