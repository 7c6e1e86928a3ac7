//! One-time device registration.
//!
//! 1. Make sure the trust anchor exists locally (download once).
//! 2. Stop if key and certificate already exist.
//! 3. Read account metadata.
//! 4. Generate key and certificate with the external tool.
//! 5. Upload the certificate. A conflict means the device id is taken on
//!    the backend; that is reported as non-fatal and nothing is deleted.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::certs::{CertError, CertificateGenerator, CertificateStore};
use crate::cloud::{CloudApi, CloudError};

/// Result type for provisioning.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to download trust anchor: {0}")]
    TrustAnchor(#[source] CloudError),

    #[error("Certificate storage error: {0}")]
    Storage(#[from] CertError),

    #[error("Failed to read account info: {0}")]
    Account(#[source] CloudError),

    /// The external tool failed; no partial credentials are kept
    #[error("Key/certificate generation failed: {0}")]
    Generation(#[source] CertError),

    /// The backend already has a device with this id
    #[error(
        "Device {device_id} is already registered. Delete it on the cloud \
         portal before provisioning again"
    )]
    AlreadyRegistered { device_id: String },

    #[error("Device registration failed: {0}")]
    Registration(#[source] CloudError),
}

impl ProvisionError {
    /// Everything but a registration conflict is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AlreadyRegistered { .. })
    }
}

/// Successful provisioning result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Identity material was already on disk
    AlreadyProvisioned,
    /// A new identity was generated and registered
    Registered {
        mqtt_host: String,
        tenant_id: Option<String>,
    },
}

/// Registers a device identity with the backend.
pub struct ProvisioningManager {
    certs: CertificateStore,
    cloud: Arc<dyn CloudApi>,
    generator: Arc<dyn CertificateGenerator>,
}

impl ProvisioningManager {
    pub fn new(
        certs: CertificateStore,
        cloud: Arc<dyn CloudApi>,
        generator: Arc<dyn CertificateGenerator>,
    ) -> Self {
        Self {
            certs,
            cloud,
            generator,
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.certs
    }

    pub async fn ensure_provisioned(&self) -> ProvisionResult<ProvisionOutcome> {
        let device_id = self.certs.device_id().to_string();
        info!(device_id = %device_id, "Provisioning device");

        self.certs.ensure_dir().await?;
        self.ensure_trust_anchor().await?;

        if self.certs.has_identity() {
            info!(device_id = %device_id, "Device certificates already exist, reusing");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        let account = self
            .cloud
            .get_account()
            .await
            .map_err(ProvisionError::Account)?;
        let mqtt_host = account.mqtt_host().to_string();
        let tenant_id = account.tenant_id();
        info!(
            mqtt_host = %mqtt_host,
            tenant_id = tenant_id.as_deref().unwrap_or("unknown"),
            prefix = %account.topic_prefix(),
            "Account info"
        );

        let key_path = self.certs.key_path();
        let cert_path = self.certs.cert_path();
        if let Err(e) = self
            .generator
            .generate(&device_id, &key_path, &cert_path)
            .await
        {
            error!(device_id = %device_id, error = %e, "Certificate generation failed");
            return Err(ProvisionError::Generation(e));
        }
        let cert_pem = self.certs.read_certificate().await?;
        info!(key = %key_path.display(), cert = %cert_path.display(), "Generated device identity");

        match self.cloud.onboard_device(&device_id, &cert_pem).await {
            Ok(()) => {
                info!(device_id = %device_id, "Device onboarded");
                Ok(ProvisionOutcome::Registered {
                    mqtt_host,
                    tenant_id,
                })
            }
            Err(e) if e.is_conflict() => {
                warn!(device_id = %device_id, "Device already exists on the cloud");
                Err(ProvisionError::AlreadyRegistered { device_id })
            }
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Onboarding failed");
                Err(ProvisionError::Registration(e))
            }
        }
    }

    async fn ensure_trust_anchor(&self) -> ProvisionResult<()> {
        if self.certs.has_trust_anchor() {
            return Ok(());
        }
        info!("Downloading trust anchor");
        let pem = self
            .cloud
            .fetch_root_ca()
            .await
            .map_err(ProvisionError::TrustAnchor)?;
        self.certs.write_trust_anchor(&pem).await?;
        Ok(())
    }
}
