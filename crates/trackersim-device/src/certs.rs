//! Identity material on disk.
//!
//! A connection needs three files in the certificates directory:
//! `{device_id}.key.pem`, `{device_id}.cert.pem` and the shared trust
//! anchor `AmazonRootCA1.pem`. Generation is delegated to an external
//! tool through [`CertificateGenerator`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// File name of the trust anchor.
pub const TRUST_ANCHOR_FILE: &str = "AmazonRootCA1.pem";

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;

/// Certificate store and generator errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tool could not be started at all
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully
    #[error("{step} failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    /// Key or certificate missing for the device
    #[error("Identity material missing for device {0}")]
    MissingIdentity(String),
}

impl CertError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Immutable per-run identity: the device id plus the three file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub ca_path: PathBuf,
}

/// PEM contents loaded for the TLS handshake.
#[derive(Clone)]
pub struct IdentityMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("ca", &self.ca.len())
            .field("cert", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DeviceIdentity {
    /// Read all three files.
    pub async fn load_material(&self) -> CertResult<IdentityMaterial> {
        Ok(IdentityMaterial {
            ca: read(&self.ca_path).await?,
            cert: read(&self.cert_path).await?,
            key: read(&self.key_path).await?,
        })
    }
}

async fn read(path: &Path) -> CertResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| CertError::io(path, e))
}

/// Tracks which identity files exist for one device.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
    device_id: String,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            device_id: device_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key.pem", self.device_id))
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cert.pem", self.device_id))
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.join(TRUST_ANCHOR_FILE)
    }

    /// Key and certificate are both present.
    pub fn has_identity(&self) -> bool {
        self.key_path().is_file() && self.cert_path().is_file()
    }

    pub fn has_trust_anchor(&self) -> bool {
        self.ca_path().is_file()
    }

    /// All three files a connection needs are present.
    pub fn exists(&self) -> bool {
        self.has_identity() && self.has_trust_anchor()
    }

    /// The identity, if every file is present.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.exists().then(|| DeviceIdentity {
            device_id: self.device_id.clone(),
            key_path: self.key_path(),
            cert_path: self.cert_path(),
            ca_path: self.ca_path(),
        })
    }

    pub fn load_identity(&self) -> CertResult<DeviceIdentity> {
        self.identity()
            .ok_or_else(|| CertError::MissingIdentity(self.device_id.clone()))
    }

    pub async fn ensure_dir(&self) -> CertResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CertError::io(&self.dir, e))
    }

    pub async fn write_trust_anchor(&self, pem: &[u8]) -> CertResult<()> {
        self.ensure_dir().await?;
        let path = self.ca_path();
        tokio::fs::write(&path, pem)
            .await
            .map_err(|e| CertError::io(&path, e))?;
        info!(path = %path.display(), "Saved trust anchor");
        Ok(())
    }

    pub async fn read_certificate(&self) -> CertResult<String> {
        let path = self.cert_path();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CertError::io(&path, e))
    }
}

/// External key/certificate generation.
#[async_trait]
pub trait CertificateGenerator: Send + Sync {
    /// Write a new private key and self-signed certificate. On failure no
    /// output file may be left behind.
    async fn generate(&self, device_id: &str, key_path: &Path, cert_path: &Path)
        -> CertResult<()>;
}

/// Runs the `openssl` CLI as argument vectors.
#[derive(Debug, Clone)]
pub struct OpensslGenerator {
    program: PathBuf,
    validity_days: u32,
}

impl Default for OpensslGenerator {
    fn default() -> Self {
        Self {
            program: PathBuf::from("openssl"),
            validity_days: 3650,
        }
    }
}

impl OpensslGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, step: &'static str, args: &[&OsStr]) -> CertResult<()> {
        debug!(step, program = %self.program.display(), "Running certificate tool");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CertError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(CertError::ToolFailed {
                step,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn generate_inner(
        &self,
        device_id: &str,
        key_path: &Path,
        cert_path: &Path,
    ) -> CertResult<()> {
        self.run(
            "key generation",
            &[
                OsStr::new("ecparam"),
                OsStr::new("-genkey"),
                OsStr::new("-name"),
                OsStr::new("prime256v1"),
                OsStr::new("-noout"),
                OsStr::new("-out"),
                key_path.as_os_str(),
            ],
        )
        .await?;

        let days = self.validity_days.to_string();
        let subject = format!("/CN={}", device_id);
        self.run(
            "certificate generation",
            &[
                OsStr::new("req"),
                OsStr::new("-new"),
                OsStr::new("-x509"),
                OsStr::new("-key"),
                key_path.as_os_str(),
                OsStr::new("-out"),
                cert_path.as_os_str(),
                OsStr::new("-days"),
                OsStr::new(&days),
                OsStr::new("-subj"),
                OsStr::new(&subject),
            ],
        )
        .await
    }
}

#[async_trait]
impl CertificateGenerator for OpensslGenerator {
    async fn generate(
        &self,
        device_id: &str,
        key_path: &Path,
        cert_path: &Path,
    ) -> CertResult<()> {
        let result = self.generate_inner(device_id, key_path, cert_path).await;
        if result.is_err() {
            remove_partial(&[key_path, cert_path]).await;
        }
        result
    }
}

/// Remove whatever a failed generation left behind.
pub async fn remove_partial(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => warn!(path = %path.display(), "Removed partially generated file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
        }
    }
}
