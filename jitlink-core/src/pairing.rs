//! Pairing credential resolution and caching.
//!
//! A [`PairingCredential`] is the signed trust record that authorizes
//! this client to open protocol sessions with a device. The
//! [`PairingStore`] resolves one through a pluggable [`PairingSource`]
//! (filesystem, keychain, provisioning service), validates it, and
//! caches it until a transport reports an authentication failure.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::LinkError;

// ── PairingCredential ────────────────────────────────────────────

/// The trust record proving the host is paired with a device.
///
/// Immutable once loaded. The `record` bytes are opaque to this crate;
/// `fingerprint` is the blake3 hex digest of `record` and must match
/// on load, catching truncated or hand-edited credential files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCredential {
    /// Unique device identifier this credential is bound to.
    pub udid: String,
    /// Identifier of the paired host.
    pub host_id: String,
    /// Opaque signed pairing record, as issued by the device.
    pub record: Vec<u8>,
    /// blake3 hex digest of `record`.
    pub fingerprint: String,
}

impl PairingCredential {
    /// Build a credential from its parts, computing the fingerprint.
    pub fn seal(udid: impl Into<String>, host_id: impl Into<String>, record: Vec<u8>) -> Self {
        let fingerprint = blake3::hash(&record).to_hex().to_string();
        Self {
            udid: udid.into(),
            host_id: host_id.into(),
            record,
            fingerprint,
        }
    }

    /// Parse a credential from its JSON encoding and validate it.
    pub fn from_json(bytes: &[u8]) -> Result<Self, LinkError> {
        let credential: Self = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::PairingInvalid(format!("unreadable record: {e}")))?;
        credential.verify()?;
        Ok(credential)
    }

    /// Serialize to the on-disk JSON encoding.
    pub fn to_json(&self) -> Result<Vec<u8>, LinkError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Check internal consistency of the credential.
    pub fn verify(&self) -> Result<(), LinkError> {
        if self.udid.is_empty() {
            return Err(LinkError::PairingInvalid("empty device identifier".into()));
        }
        if self.host_id.is_empty() {
            return Err(LinkError::PairingInvalid("empty host identifier".into()));
        }
        let actual = blake3::hash(&self.record).to_hex().to_string();
        if actual != self.fingerprint {
            return Err(LinkError::PairingInvalid(
                "record fingerprint mismatch".into(),
            ));
        }
        Ok(())
    }
}

// ── PairingSource ────────────────────────────────────────────────

/// Host-specific discovery of a raw pairing record.
#[async_trait]
pub trait PairingSource: Send + Sync {
    /// Locate the raw credential bytes, or `None` if the host has no
    /// pairing for this device.
    async fn locate(&self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// Looks for a credential file in a list of candidate paths, first
/// match wins.
pub struct FilePairingSource {
    search_paths: Vec<PathBuf>,
}

impl FilePairingSource {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Single-path convenience constructor.
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::new(vec![path.into()])
    }
}

#[async_trait]
impl PairingSource for FilePairingSource {
    async fn locate(&self) -> Result<Option<Vec<u8>>, LinkError> {
        for path in &self.search_paths {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    debug!(path = %path.display(), "pairing record located");
                    return Ok(Some(bytes));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

// ── PairingStore ─────────────────────────────────────────────────

/// Resolves and caches the pairing credential for one device.
pub struct PairingStore {
    source: Box<dyn PairingSource>,
    cached: Mutex<Option<PairingCredential>>,
}

impl PairingStore {
    pub fn new(source: impl PairingSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cached: Mutex::new(None),
        }
    }

    /// Return the cached credential, or discover and validate one.
    ///
    /// Fails with [`LinkError::NoPairingFound`] when the source has
    /// nothing, or [`LinkError::PairingInvalid`] when validation fails.
    pub async fn get_pairing(&self) -> Result<PairingCredential, LinkError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            return Ok(credential.clone());
        }

        let raw = self
            .source
            .locate()
            .await?
            .ok_or(LinkError::NoPairingFound)?;
        let credential = PairingCredential::from_json(&raw)?;
        debug!(udid = %credential.udid, "pairing credential resolved");

        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential so the next resolve re-discovers.
    ///
    /// Called when a transport reports an authentication failure.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

// ── Tests ────────────────────────────────────────────────────────
