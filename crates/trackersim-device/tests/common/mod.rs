//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use trackersim_core::Envelope;
use trackersim_device::certs::{CertError, CertResult, CertificateGenerator, CertificateStore};
use trackersim_device::cloud::{AccountInfo, CloudApi, CloudError, CloudResult, DeviceRecord};
use trackersim_device::connection::Publisher;
use trackersim_device::transport::{
    Transport, TransportConnector, TransportError, TransportEvent, TransportOptions,
    TransportResult, TransportSession,
};
use trackersim_device::{ConnectionInfo, DeviceIdentity};

pub const DEVICE_ID: &str = "device123";

pub fn status_error(status: u16) -> CloudError {
    CloudError::Status {
        method: "GET".to_string(),
        path: "/mock".to_string(),
        status,
        body: String::new(),
    }
}

/// Scripted REST backend.
pub struct MockCloud {
    pub account: Value,
    pub device: Value,
    pub device_status: Option<u16>,
    pub onboard_status: Option<u16>,
    pub account_calls: AtomicUsize,
    pub device_calls: AtomicUsize,
    pub onboard_calls: AtomicUsize,
    pub root_ca_calls: AtomicUsize,
    pub onboarded_certs: Mutex<Vec<String>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            account: json!({
                "mqttEndpoint": "mqtt.example.test",
                "mqttTopicPrefix": "prod/tenant-1/",
                "tenantId": "tenant-1"
            }),
            device: json!({"id": DEVICE_ID, "tags": ["simulator"]}),
            device_status: None,
            onboard_status: None,
            account_calls: AtomicUsize::new(0),
            device_calls: AtomicUsize::new(0),
            onboard_calls: AtomicUsize::new(0),
            root_ca_calls: AtomicUsize::new(0),
            onboarded_certs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device(mut self, device: Value) -> Self {
        self.device = device;
        self
    }

    pub fn with_device_status(mut self, status: u16) -> Self {
        self.device_status = Some(status);
        self
    }

    pub fn with_onboard_status(mut self, status: u16) -> Self {
        self.onboard_status = Some(status);
        self
    }

    pub fn backend_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst) + self.device_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn get_account(&self) -> CloudResult<AccountInfo> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(self.account.clone()).unwrap())
    }

    async fn get_device(&self, _device_id: &str) -> CloudResult<DeviceRecord> {
        self.device_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.device_status {
            return Err(status_error(status));
        }
        Ok(serde_json::from_value(self.device.clone()).unwrap())
    }

    async fn update_device_state(&self, _device_id: &str, _state: &Value) -> CloudResult<()> {
        Ok(())
    }

    async fn onboard_device(&self, _device_id: &str, cert_pem: &str) -> CloudResult<()> {
        self.onboard_calls.fetch_add(1, Ordering::SeqCst);
        self.onboarded_certs.lock().push(cert_pem.to_string());
        match self.onboard_status {
            Some(status) => Err(status_error(status)),
            None => Ok(()),
        }
    }

    async fn fetch_root_ca(&self) -> CloudResult<Vec<u8>> {
        self.root_ca_calls.fetch_add(1, Ordering::SeqCst);
        Ok(b"-----BEGIN CERTIFICATE-----\nROOT\n-----END CERTIFICATE-----\n".to_vec())
    }
}

/// Writes fake PEM files, or fails like a broken tool would.
pub struct MockGenerator {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl MockGenerator {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CertificateGenerator for MockGenerator {
    async fn generate(&self, device_id: &str, key_path: &Path, cert_path: &Path) -> CertResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CertError::ToolFailed {
                step: "key generation",
                code: Some(1),
                stderr: "boom".to_string(),
            });
        }
        std::fs::write(key_path, "KEY").unwrap();
        std::fs::write(
            cert_path,
            format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", device_id),
        )
        .unwrap();
        Ok(())
    }
}

/// Records everything a session does on the wire.
#[derive(Default)]
pub struct MockTransport {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub subscriptions: Mutex<Vec<String>>,
    pub disconnected: AtomicBool,
    pub reject_publish: AtomicBool,
}

impl MockTransport {
    pub fn published_envelopes(&self) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Client("queue full".to_string()));
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MockTransport`] sessions and replies with a scripted ConnAck.
pub struct MockConnector {
    pub connack: Option<u8>,
    pub fail_open: bool,
    pub transport: Arc<MockTransport>,
    pub events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    pub opened: Mutex<Vec<ConnectionInfo>>,
}

impl MockConnector {
    pub fn accepting() -> Self {
        Self::with_connack(Some(0))
    }

    pub fn with_connack(connack: Option<u8>) -> Self {
        Self {
            connack,
            fail_open: false,
            transport: Arc::new(MockTransport::default()),
            events: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::with_connack(None)
        }
    }

    /// Push an event as if the transport produced it.
    pub fn emit(&self, event: TransportEvent) {
        // the coordinator may already have stopped listening
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(
        &self,
        _identity: &DeviceIdentity,
        info: &ConnectionInfo,
        _options: &TransportOptions,
    ) -> TransportResult<TransportSession> {
        if self.fail_open {
            return Err(TransportError::Client("connection refused by OS".to_string()));
        }
        self.opened.lock().push(info.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(code) = self.connack {
            tx.send(TransportEvent::ConnAck { code }).unwrap();
        }
        *self.events.lock() = Some(tx);
        Ok(TransportSession {
            transport: self.transport.clone(),
            events: rx,
        })
    }
}

/// Publisher that records envelopes.
pub struct RecordingPublisher {
    pub connected: AtomicBool,
    pub sent: Mutex<Vec<Envelope>>,
}

impl RecordingPublisher {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: &Envelope) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent.lock().push(message.clone());
        true
    }
}

/// Write key, certificate and trust anchor for `device_id`.
pub fn write_identity(dir: &Path, device_id: &str) -> CertificateStore {
    let store = CertificateStore::new(dir, device_id);
    std::fs::write(store.key_path(), "KEY").unwrap();
    std::fs::write(store.cert_path(), "CERT").unwrap();
    std::fs::write(store.ca_path(), "CA").unwrap();
    store
}
