use crate::exchange::error::ExchangeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::Signer as _;
use ed25519_dalek::SigningKey;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Kind of API key registered on the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Hmac,
    Ed25519,
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hmac" => Ok(KeyType::Hmac),
            "ed25519" => Ok(KeyType::Ed25519),
            other => Err(format!("unknown key type: {}", other)),
        }
    }
}

/// Request signer for either key type
#[derive(Clone)]
pub enum Signer {
    /// HMAC-SHA256 over the query string, hex encoded
    Hmac { secret: String },
    /// Ed25519 over the query string, base64 encoded
    Ed25519 { key: SigningKey },
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signer::Hmac { .. } => f.write_str("Signer::Hmac(<redacted>)"),
            Signer::Ed25519 { .. } => f.write_str("Signer::Ed25519(<redacted>)"),
        }
    }
}

impl Signer {
    pub fn hmac(secret: impl Into<String>) -> Self {
        Signer::Hmac { secret: secret.into() }
    }

    /// Load an Ed25519 key from PKCS#8 PEM, or from a base64 raw 32-byte seed
    pub fn ed25519_from_str(material: &str) -> Result<Self, ExchangeError> {
        let material = material.trim();

        if material.starts_with("-----BEGIN") {
            let key = SigningKey::from_pkcs8_pem(material)
                .map_err(|e| ExchangeError::Credentials(format!("invalid Ed25519 PEM: {}", e)))?;
            return Ok(Signer::Ed25519 { key });
        }

        let bytes = STANDARD
            .decode(material)
            .map_err(|e| ExchangeError::Credentials(format!("invalid Ed25519 seed: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ExchangeError::Credentials(format!("Ed25519 seed must be 32 bytes, got {}", bytes.len()))
        })?;

        Ok(Signer::Ed25519 { key: SigningKey::from_bytes(&seed) })
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Signer::Hmac { .. } => KeyType::Hmac,
            Signer::Ed25519 { .. } => KeyType::Ed25519,
        }
    }

    /// Sign the exact payload string that will be sent
    pub fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        match self {
            Signer::Hmac { secret } => generate_signature(secret, payload),
            Signer::Ed25519 { key } => {
                let signature = key.sign(payload.as_bytes());
                Ok(STANDARD.encode(signature.to_bytes()))
            }
        }
    }
}

/// API key plus signer
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub signer: Signer,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, signer: Signer) -> Self {
        Self { api_key: api_key.into(), signer }
    }

    /// Read credentials from the environment
    ///
    /// `BINANCE_API_KEY` is always required. HMAC keys read
    /// `BINANCE_SECRET_KEY`; Ed25519 keys read `BINANCE_PRIVATE_KEY` (PEM or
    /// base64 seed) or fall back to the file at `BINANCE_PRIVATE_KEY_PATH`.
    pub fn from_env(key_type: KeyType) -> Result<Self, ExchangeError> {
        let api_key = require_env("BINANCE_API_KEY")?;

        let signer = match key_type {
            KeyType::Hmac => Signer::hmac(require_env("BINANCE_SECRET_KEY")?),
            KeyType::Ed25519 => match std::env::var("BINANCE_PRIVATE_KEY") {
                Ok(material) => Signer::ed25519_from_str(&material)?,
                Err(_) => {
                    let path = require_env("BINANCE_PRIVATE_KEY_PATH")?;
                    let material = std::fs::read_to_string(&path).map_err(|e| {
                        ExchangeError::Credentials(format!("cannot read {}: {}", path, e))
                    })?;
                    Signer::ed25519_from_str(&material)?
                }
            },
        };

        Ok(Self { api_key, signer })
    }
}

fn require_env(name: &str) -> Result<String, ExchangeError> {
    std::env::var(name).map_err(|_| ExchangeError::Credentials(format!("{} not set", name)))
}

/// Generate HMAC-SHA256 signature, hex encoded
pub fn generate_signature(secret_key: &str, query_string: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| ExchangeError::Credentials(format!("HMAC key: {}", e)))?;
    mac.update(query_string.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Local wall clock in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Offset between the exchange clock and the local clock
#[derive(Debug, Default)]
pub struct TimeSync {
    offset_ms: AtomicI64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the server time observed at local time `local_ms`
    pub fn update(&self, server_ms: u64, local_ms: u64) {
        let offset = server_ms as i64 - local_ms as i64;
        self.offset_ms.store(offset, Ordering::Relaxed);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Local time corrected towards server time
    pub fn timestamp(&self) -> u64 {
        (get_timestamp() as i64 + self.offset_ms()).max(0) as u64
    }
}

/// Build the signed query string
///
/// Params are form-encoded in order, then `recvWindow` and `timestamp` are
/// appended and the whole string is signed. The signature goes last.
pub fn build_signed_query<K, V>(
    params: &[(K, V)],
    signer: &Signer,
    timestamp_ms: u64,
    recv_window_ms: Option<u64>,
) -> Result<String, ExchangeError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in params {
        serializer.append_pair(k.as_ref(), v.as_ref());
    }
    if let Some(window) = recv_window_ms {
        serializer.append_pair("recvWindow", &window.to_string());
    }
    serializer.append_pair("timestamp", &timestamp_ms.to_string());
    let payload = serializer.finish();

    let signature = signer.sign(&payload)?;

    let mut tail = url::form_urlencoded::Serializer::new(String::new());
    tail.append_pair("signature", &signature);
    Ok(format!("{}&{}", payload, tail.finish()))
}
