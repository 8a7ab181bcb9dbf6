use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::BankError;

/// Signs second-factor one-time tokens with the configured private key:
/// RSA-SHA256, PKCS#1 v1.5 padding, base64 output.
pub struct ScaSigner {
    key: RsaPrivateKey,
}

impl ScaSigner {
    pub fn from_pem(pem: &str) -> Result<Self, BankError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| BankError::AuthRequired(format!("unusable private key: {e}")))?;
        Ok(Self { key })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, BankError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            BankError::AuthRequired(format!("private key not found at {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    pub fn sign(&self, ott: &str) -> Result<String, BankError> {
        let digest = Sha256::digest(ott.as_bytes());
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| BankError::SigningFailed(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(signature))
    }
}

/// A completed handshake: the OTT/signature pair the bank accepts for a
/// few minutes after the challenge.
#[derive(Debug, Clone)]
pub struct ScaSession {
    pub ott: String,
    pub signature: String,
    pub obtained_at: DateTime<Utc>,
}

/// Per-profile session cache. Callers lock a profile's slot for the whole
/// challenged request, so concurrent requests coalesce onto one handshake
/// and the losers reuse the winner's session.
pub struct SessionCache {
    ttl: Duration,
    slots: Mutex<HashMap<i64, Arc<Mutex<Option<ScaSession>>>>>,
}

impl SessionCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs as i64),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn slot(&self, profile_id: i64) -> Arc<Mutex<Option<ScaSession>>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(profile_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub fn is_fresh(&self, session: &ScaSession, now: DateTime<Utc>) -> bool {
        now - session.obtained_at < self.ttl
    }
}
