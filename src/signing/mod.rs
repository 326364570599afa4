//! Signing and authentication for the CLOB.
//!
//! Two layers of auth exist:
//! - L1 (wallet): an EIP-712 signature over a `ClobAuth` message, used
//!   once per session to derive API credentials.
//! - L2 (API key): HMAC-SHA256 headers attached to every authenticated
//!   request, built from the derived credentials.
//!
//! Signers are cached by key hash to avoid re-deriving the keypair on
//! every call.

use std::collections::HashMap;
use std::sync::RwLock;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::error::ExecutionError;

type HmacSha256 = Hmac<Sha256>;

/// Polygon mainnet chain id.
pub const POLYGON_CHAIN_ID: u64 = 137;

/// CLOB authentication EIP-712 domain name.
pub const CLOB_DOMAIN_NAME: &str = "ClobAuthDomain";
/// CLOB authentication EIP-712 domain version.
pub const CLOB_DOMAIN_VERSION: &str = "1";
/// Attestation text carried in the auth message.
pub const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

/// Global signer cache keyed by a hash of the private key, so raw keys
/// never sit in the map.
static SIGNER_CACHE: Lazy<RwLock<HashMap<u64, PrivateKeySigner>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn key_hash(private_key: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    private_key.hash(&mut hasher);
    hasher.finish()
}

/// Create a signer from a hex-encoded private key, with or without the
/// "0x" prefix.
pub fn create_signer(private_key: &str) -> Result<PrivateKeySigner, ExecutionError> {
    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
    let bytes = hex::decode(key)
        .map_err(|e| ExecutionError::SigningError(format!("invalid private key hex: {}", e)))?;

    if bytes.len() != 32 {
        return Err(ExecutionError::SigningError(format!(
            "private key must be 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&bytes);

    PrivateKeySigner::from_bytes(&key_bytes.into())
        .map_err(|e| ExecutionError::SigningError(format!("failed to create signer: {}", e)))
}

/// Get or create a cached signer for the given private key.
pub fn get_or_create_signer(private_key: &str) -> Result<PrivateKeySigner, ExecutionError> {
    let hash = key_hash(private_key);

    {
        let cache = SIGNER_CACHE
            .read()
            .map_err(|e| ExecutionError::SigningError(format!("cache read lock: {}", e)))?;
        if let Some(signer) = cache.get(&hash) {
            return Ok(signer.clone());
        }
    }

    let signer = create_signer(private_key)?;

    {
        let mut cache = SIGNER_CACHE
            .write()
            .map_err(|e| ExecutionError::SigningError(format!("cache write lock: {}", e)))?;
        // Another task may have raced us here.
        if let Some(existing) = cache.get(&hash) {
            return Ok(existing.clone());
        }
        debug!("caching new signer");
        cache.insert(hash, signer.clone());
    }

    Ok(signer)
}

/// Get the wallet address from a private key.
pub fn address_from_private_key(private_key: &str) -> Result<String, ExecutionError> {
    let signer = create_signer(private_key)?;
    Ok(format!("{:?}", signer.address()))
}

/// EIP-712 domain for CLOB authentication.
#[derive(Debug, Clone)]
pub struct ClobAuthDomain {
    name: String,
    version: String,
    chain_id: u64,
}

impl ClobAuthDomain {
    /// Domain for the given chain.
    pub fn new(chain_id: u64) -> Self {
        Self {
            name: CLOB_DOMAIN_NAME.to_string(),
            version: CLOB_DOMAIN_VERSION.to_string(),
            chain_id,
        }
    }

    /// EIP-712 domain separator hash.
    pub fn separator_hash(&self) -> B256 {
        let type_hash = keccak256(b"EIP712Domain(string name,string version,uint256 chainId)");
        let name_hash = keccak256(self.name.as_bytes());
        let version_hash = keccak256(self.version.as_bytes());

        let mut encoded = Vec::with_capacity(128);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(name_hash.as_slice());
        encoded.extend_from_slice(version_hash.as_slice());
        encoded.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());

        keccak256(&encoded)
    }
}

/// CLOB authentication message signed to prove wallet control.
#[derive(Debug, Clone)]
pub struct ClobAuthMessage {
    address: Address,
    timestamp: String,
    nonce: U256,
    message: String,
}

impl ClobAuthMessage {
    /// Build the message for a wallet at a given timestamp.
    pub fn new(address: Address, timestamp: i64, nonce: u64) -> Self {
        Self {
            address,
            timestamp: timestamp.to_string(),
            nonce: U256::from(nonce),
            message: CLOB_AUTH_MESSAGE.to_string(),
        }
    }

    /// EIP-712 struct hash.
    pub fn struct_hash(&self) -> B256 {
        let type_hash =
            keccak256(b"ClobAuth(address address,string timestamp,uint256 nonce,string message)");
        let timestamp_hash = keccak256(self.timestamp.as_bytes());
        let message_hash = keccak256(self.message.as_bytes());

        let mut encoded = Vec::with_capacity(160);
        encoded.extend_from_slice(type_hash.as_slice());
        // address left-pads to 32 bytes
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(self.address.as_slice());
        encoded.extend_from_slice(timestamp_hash.as_slice());
        encoded.extend_from_slice(&self.nonce.to_be_bytes::<32>());
        encoded.extend_from_slice(message_hash.as_slice());

        keccak256(&encoded)
    }

    /// Full EIP-712 hash to sign.
    pub fn signing_hash(&self, domain: &ClobAuthDomain) -> B256 {
        let mut encoded = Vec::with_capacity(66);
        encoded.extend_from_slice(b"\x19\x01");
        encoded.extend_from_slice(domain.separator_hash().as_slice());
        encoded.extend_from_slice(self.struct_hash().as_slice());
        keccak256(&encoded)
    }
}

/// L1 auth headers for the credential-derivation endpoint.
///
/// Signs a `ClobAuth` message with the wallet key; the exchange verifies
/// the signature and returns (or re-derives) the API credentials.
pub async fn build_l1_headers(
    private_key: &str,
    nonce: u64,
) -> Result<Vec<(String, String)>, ExecutionError> {
    let signer = get_or_create_signer(private_key)?;
    let address = signer.address();
    let timestamp = chrono::Utc::now().timestamp();

    let domain = ClobAuthDomain::new(POLYGON_CHAIN_ID);
    let message = ClobAuthMessage::new(address, timestamp, nonce);
    let hash = message.signing_hash(&domain);

    let signature = signer
        .sign_hash(&hash)
        .await
        .map_err(|e| ExecutionError::SigningError(format!("failed to sign auth message: {}", e)))?;

    Ok(vec![
        ("POLY_ADDRESS".to_string(), format!("{:?}", address)),
        (
            "POLY_SIGNATURE".to_string(),
            format!("0x{}", hex::encode(signature.as_bytes())),
        ),
        ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
        ("POLY_NONCE".to_string(), nonce.to_string()),
    ])
}

/// API credentials for L2 authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCredentials {
    /// API key id.
    #[serde(alias = "apiKey")]
    pub api_key: String,
    /// Base64-encoded HMAC secret.
    pub secret: String,
    /// Key passphrase.
    pub passphrase: String,
}

impl ApiCredentials {
    /// Construct credentials directly (for config-supplied keys).
    pub fn new(api_key: String, secret: String, passphrase: String) -> Self {
        Self {
            api_key,
            secret,
            passphrase,
        }
    }
}

/// HMAC authentication helper for L2 API requests.
#[derive(Clone)]
pub struct HmacAuth {
    credentials: ApiCredentials,
    address: String,
}

impl HmacAuth {
    /// Bind credentials to a wallet address.
    pub fn new(credentials: ApiCredentials, address: String) -> Self {
        Self {
            credentials,
            address,
        }
    }

    fn sign(&self, message: &str) -> Result<String, ExecutionError> {
        let secret_bytes = BASE64
            .decode(&self.credentials.secret)
            .map_err(|e| ExecutionError::SigningError(format!("invalid secret encoding: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| ExecutionError::SigningError(format!("hmac init failed: {}", e)))?;
        mac.update(message.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn build_message(&self, method: &str, path: &str, timestamp: i64, body: Option<&str>) -> String {
        match body {
            Some(b) if !b.is_empty() => {
                format!("{}{}{}{}", timestamp, method.to_uppercase(), path, b)
            }
            _ => format!("{}{}{}", timestamp, method.to_uppercase(), path),
        }
    }

    /// Build L2 authentication headers for a request.
    pub fn build_headers(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<HeaderMap, ExecutionError> {
        let timestamp = chrono::Utc::now().timestamp();
        let message = self.build_message(method, path, timestamp, body);
        let signature = self.sign(&message)?;

        let mut headers = HeaderMap::new();
        let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            HeaderValue::from_str(value)
                .map(|v| {
                    headers.insert(name, v);
                })
                .map_err(|e| ExecutionError::SigningError(format!("invalid {} header: {}", name, e)))
        };

        insert(&mut headers, "POLY_ADDRESS", &self.address)?;
        insert(&mut headers, "POLY_SIGNATURE", &signature)?;
        insert(&mut headers, "POLY_TIMESTAMP", &timestamp.to_string())?;
        insert(&mut headers, "POLY_API_KEY", &self.credentials.api_key)?;
        insert(&mut headers, "POLY_PASSPHRASE", &self.credentials.passphrase)?;

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn create_signer_accepts_prefixed_and_bare_keys() {
        assert!(create_signer(TEST_KEY).is_ok());
        assert!(create_signer(TEST_KEY.strip_prefix("0x").unwrap()).is_ok());
    }

    #[test]
    fn create_signer_rejects_bad_keys() {
        assert!(create_signer("0xnot_valid_hex").is_err());
        assert!(create_signer("0x1234").is_err());
    }

    #[test]
    fn address_from_key() {
        let addr = address_from_private_key(TEST_KEY).unwrap();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
    }

    #[test]
    fn cached_signer_matches_fresh() {
        let fresh = create_signer(TEST_KEY).unwrap();
        let cached = get_or_create_signer(TEST_KEY).unwrap();
        assert_eq!(fresh.address(), cached.address());
        let again = get_or_create_signer(TEST_KEY).unwrap();
        assert_eq!(cached.address(), again.address());
    }

    #[test]
    fn auth_message_hashes_are_stable() {
        let address: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
            .parse()
            .unwrap();
        let message = ClobAuthMessage::new(address, 1704067200, 0);
        let domain = ClobAuthDomain::new(POLYGON_CHAIN_ID);

        let first = message.signing_hash(&domain);
        let second = message.signing_hash(&domain);
        assert_eq!(first, second);
        assert_ne!(first, B256::ZERO);
    }

    #[test]
    fn hmac_message_layout() {
        let creds = ApiCredentials::new(
            "test-key".to_string(),
            BASE64.encode(b"test-secret"),
            "test-pass".to_string(),
        );
        let auth = HmacAuth::new(creds, "0x1234".to_string());

        let msg = auth.build_message("POST", "/order", 1704067200, Some(r#"{"test":"data"}"#));
        assert_eq!(msg, r#"1704067200POST/order{"test":"data"}"#);

        let msg_no_body = auth.build_message("GET", "/orders", 1704067200, None);
        assert_eq!(msg_no_body, "1704067200GET/orders");
    }

    #[test]
    fn hmac_signature_is_base64() {
        let creds = ApiCredentials::new(
            "test-key".to_string(),
            BASE64.encode(b"test-secret"),
            "test-pass".to_string(),
        );
        let auth = HmacAuth::new(creds, "0x1234".to_string());

        let sig = auth.sign("test message").unwrap();
        assert!(!sig.is_empty());
        assert!(BASE64.decode(&sig).is_ok());
    }

    #[test]
    fn l2_headers_carry_all_fields() {
        let creds = ApiCredentials::new(
            "test-key".to_string(),
            BASE64.encode(b"test-secret"),
            "test-pass".to_string(),
        );
        let auth = HmacAuth::new(creds, "0x1234".to_string());

        let headers = auth.build_headers("GET", "/balance", None).unwrap();
        for name in [
            "POLY_ADDRESS",
            "POLY_SIGNATURE",
            "POLY_TIMESTAMP",
            "POLY_API_KEY",
            "POLY_PASSPHRASE",
        ] {
            assert!(headers.contains_key(name), "missing {}", name);
        }
    }
}
