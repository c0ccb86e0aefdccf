//! Per-request encrypted proxying to storage nodes.
//!
//! Every logical RPC to a storage node travels through a second node acting
//! as a store-and-forward proxy, so the target never learns the caller's
//! network origin.  Confidentiality between caller and target comes from a
//! per-request [`ProxySession`]: a fresh x25519 keypair, a shared symmetric
//! key derived against the target's encryption key, and AES-256-CBC over the
//! serialized request.  A session lives for exactly one request/response
//! pair and is never persisted.
//!
//! All failures on this path are soft: a timeout, transport error, or
//! undecryptable response yields `None`, and the caller moves on to the
//! remaining peers.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::snode::SnodeTarget;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LENGTH: usize = 16;

pub const HEADER_SENDER_KEY: &str = "X-Sender-Public-Key";
pub const HEADER_TARGET_KEY: &str = "X-Target-Snode-Key";

#[derive(Debug)]
pub enum ProxyError {
    BadEncryptionKey,
    Serialize(serde_json::Error),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::BadEncryptionKey => write!(f, "target encryption key is not 32 hex bytes"),
            ProxyError::Serialize(e) => write!(f, "serialize request: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Serialize(e)
    }
}

/// Ephemeral cipher state for one proxied request/response pair.
pub struct ProxySession {
    public_key: [u8; 32],
    symmetric_key: [u8; 32],
}

impl ProxySession {
    /// Generate an ephemeral keypair and agree on a symmetric key with the
    /// target's x25519 encryption key.
    pub fn open(target: &SnodeTarget) -> Result<Self, ProxyError> {
        let target_key: [u8; 32] = hex::decode(&target.encryption_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(ProxyError::BadEncryptionKey)?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(target_key));
        Ok(Self {
            public_key,
            symmetric_key: shared.to_bytes(),
        })
    }

    /// Hex form of the caller's ephemeral public key, sent in the
    /// `X-Sender-Public-Key` header so the target can derive the same key.
    pub fn sender_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Serialize and encrypt one RPC for the proxy to forward.
    ///
    /// The proxied body is `{method: "POST", body: json({method, params}),
    /// headers: {}}`; the IV is prepended to the ciphertext.
    pub fn sealed_request(&self, method: &str, params: &Value) -> Result<Vec<u8>, ProxyError> {
        let rpc = json!({ "method": method, "params": params });
        let wrapper = json!({
            "method": "POST",
            "body": serde_json::to_string(&rpc)?,
            "headers": {}
        });
        let plaintext = serde_json::to_vec(&wrapper)?;
        Ok(aes_cbc_encrypt(&self.symmetric_key, &plaintext))
    }

    /// Decode a proxied response: base64, then IV-prefixed AES-256-CBC,
    /// then JSON.  Any failure along the way yields `None`; callers treat
    /// that the same as a peer that returned nothing.
    pub fn parse_response(&self, raw: &str) -> Option<Value> {
        let decoded = BASE64.decode(raw.trim()).ok()?;
        let plaintext = aes_cbc_decrypt(&self.symmetric_key, &decoded)?;
        serde_json::from_slice(&plaintext).ok()
    }
}

/// AES-256-CBC with PKCS#7 padding; a fresh random IV is prepended.
pub fn aes_cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    let ciphertext =
        Aes256CbcEnc::new(key.into(), (&iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut out = Vec::with_capacity(IV_LENGTH + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Inverse of [`aes_cbc_encrypt`]; `None` on truncated input or bad padding.
pub fn aes_cbc_decrypt(key: &[u8; 32], iv_and_ciphertext: &[u8]) -> Option<Vec<u8>> {
    if iv_and_ciphertext.len() <= IV_LENGTH {
        return None;
    }
    let (iv, ciphertext) = iv_and_ciphertext.split_at(IV_LENGTH);
    if ciphertext.len() % 16 != 0 {
        return None;
    }
    let iv: [u8; IV_LENGTH] = iv.try_into().ok()?;
    Aes256CbcDec::new(key.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()
}

/// Send one proxied RPC and return the decrypted response body, or `None`
/// for any transport, cipher, or parse failure.
pub fn proxy_rpc(
    agent: &ureq::Agent,
    proxy: &SnodeTarget,
    target: &SnodeTarget,
    method: &str,
    params: &Value,
) -> Option<Value> {
    let session = ProxySession::open(target).ok()?;
    let body = session.sealed_request(method, params).ok()?;
    let response = agent
        .post(&proxy.proxy_url())
        .set(HEADER_SENDER_KEY, &session.sender_key_hex())
        .set(HEADER_TARGET_KEY, &target.id_key)
        .send_bytes(&body)
        .ok()?;
    let raw = response.into_string().ok()?;
    session.parse_response(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn cbc_round_trips() {
        let plaintext = b"{\"method\":\"retrieve\"}";
        let sealed = aes_cbc_encrypt(&KEY, plaintext);
        assert!(sealed.len() > IV_LENGTH);
        assert_eq!(aes_cbc_decrypt(&KEY, &sealed).as_deref(), Some(&plaintext[..]));
    }

    #[test]
    fn cbc_rejects_wrong_key_and_truncation() {
        let sealed = aes_cbc_encrypt(&KEY, b"payload bytes");
        let wrong_key = [8u8; 32];
        // Wrong key either fails the padding check or yields garbage.
        assert_ne!(
            aes_cbc_decrypt(&wrong_key, &sealed).as_deref(),
            Some(&b"payload bytes"[..])
        );
        assert_eq!(aes_cbc_decrypt(&KEY, &sealed[..IV_LENGTH]), None);
        assert_eq!(aes_cbc_decrypt(&KEY, &sealed[..IV_LENGTH + 5]), None);
    }

    #[test]
    fn open_rejects_malformed_encryption_key() {
        let target = SnodeTarget {
            host: "1.2.3.4".into(),
            port: 443,
            id_key: "ed".into(),
            encryption_key: "not-hex".into(),
        };
        assert!(ProxySession::open(&target).is_err());
    }
}
