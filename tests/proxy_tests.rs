//! Round-trip tests for the proxied request cipher, playing the storage
//! node's side of the key agreement with a static x25519 key.

use serde_json::{json, Value};
use x25519_dalek::{PublicKey, StaticSecret};

use swarmgate::proxy::{aes_cbc_decrypt, aes_cbc_encrypt, ProxySession};
use swarmgate::snode::SnodeTarget;

struct FakeSnode {
    secret: StaticSecret,
}

impl FakeSnode {
    fn new() -> Self {
        Self {
            secret: StaticSecret::from([42u8; 32]),
        }
    }

    fn target(&self) -> SnodeTarget {
        let public = PublicKey::from(&self.secret);
        SnodeTarget {
            host: "203.0.113.7".to_string(),
            port: 22021,
            id_key: "ed25519-key".to_string(),
            encryption_key: hex::encode(public.to_bytes()),
        }
    }

    /// Derive the same symmetric key the caller computed, from the
    /// `X-Sender-Public-Key` header value.
    fn shared_key(&self, sender_key_hex: &str) -> [u8; 32] {
        let bytes: [u8; 32] = hex::decode(sender_key_hex)
            .unwrap()
            .try_into()
            .unwrap();
        self.secret
            .diffie_hellman(&PublicKey::from(bytes))
            .to_bytes()
    }
}

#[test]
fn snode_can_decrypt_sealed_request() {
    let snode = FakeSnode::new();
    let session = ProxySession::open(&snode.target()).unwrap();

    let params = json!({ "pubKey": "05aabb", "lastHash": "" });
    let sealed = session.sealed_request("retrieve", &params).unwrap();

    let key = snode.shared_key(&session.sender_key_hex());
    let plaintext = aes_cbc_decrypt(&key, &sealed).expect("snode decrypts request");
    let wrapper: Value = serde_json::from_slice(&plaintext).unwrap();

    assert_eq!(wrapper["method"], "POST");
    let inner: Value = serde_json::from_str(wrapper["body"].as_str().unwrap()).unwrap();
    assert_eq!(inner["method"], "retrieve");
    assert_eq!(inner["params"]["pubKey"], "05aabb");
}

#[test]
fn caller_can_parse_snode_response() {
    use base64::Engine as _;

    let snode = FakeSnode::new();
    let session = ProxySession::open(&snode.target()).unwrap();
    let key = snode.shared_key(&session.sender_key_hex());

    let response = json!({ "body": "{\"messages\": []}", "status": 200 });
    let sealed = aes_cbc_encrypt(&key, response.to_string().as_bytes());
    let raw = base64::engine::general_purpose::STANDARD.encode(sealed);

    let parsed = session.parse_response(&raw).expect("caller decrypts response");
    assert_eq!(parsed, response);

    // Whitespace around the base64 payload is tolerated.
    let padded = format!("\n  {raw}  \n");
    assert_eq!(session.parse_response(&padded), Some(response));
}

#[test]
fn malformed_responses_parse_to_none() {
    let snode = FakeSnode::new();
    let session = ProxySession::open(&snode.target()).unwrap();

    // Not base64 at all.
    assert_eq!(session.parse_response("!!not base64!!"), None);
    // Valid base64 of garbage bytes.
    use base64::Engine as _;
    let garbage = base64::engine::general_purpose::STANDARD.encode([1u8; 48]);
    assert_eq!(session.parse_response(&garbage), None);
    // Too short to contain an IV.
    let short = base64::engine::general_purpose::STANDARD.encode([1u8; 8]);
    assert_eq!(session.parse_response(&short), None);
}

#[test]
fn each_session_uses_a_fresh_ephemeral_key() {
    let snode = FakeSnode::new();
    let target = snode.target();
    let a = ProxySession::open(&target).unwrap();
    let b = ProxySession::open(&target).unwrap();
    assert_ne!(a.sender_key_hex(), b.sender_key_hex());
}
