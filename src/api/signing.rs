use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("failed to gather key material: {0}")]
    KeyMaterial(String),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-job ed25519 keypair. Generated once when the job is claimed, passed
/// explicitly to every signed call, and discarded with the run. The private
/// half never leaves the process.
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Result<Self, SigningError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|err| SigningError::KeyMaterial(err.to_string()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key.verifying_key().as_bytes())
    }

    /// Signs the sha-256 digest of `bytes`; the signature travels as base64.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        BASE64.encode(self.key.sign(&digest).to_bytes())
    }

    /// Signs a payload after deterministic serialization, so both sides can
    /// reproduce the exact signed bytes regardless of field insertion order.
    pub fn sign_payload(&self, fields: &BTreeMap<String, Value>) -> Result<String, SigningError> {
        let bytes = canonical_json(fields)?;
        Ok(self.sign_bytes(&bytes))
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Deterministic JSON serialization: `BTreeMap` ordering gives sorted keys,
/// and `serde_json` emits no insignificant whitespace.
pub fn canonical_json(fields: &BTreeMap<String, Value>) -> Result<Vec<u8>, SigningError> {
    Ok(serde_json::to_vec(fields)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;

    fn decode_signature(raw: &str) -> Signature {
        let bytes = BASE64.decode(raw).expect("base64 signature");
        Signature::from_bytes(&bytes.try_into().expect("64-byte signature"))
    }

    #[test]
    fn signature_verifies_against_public_half() {
        let identity = SigningIdentity::generate().expect("generate");
        let signature = identity.sign_bytes(b"job-123");
        let digest = Sha256::digest(b"job-123");
        identity
            .verifying_key()
            .verify(&digest, &decode_signature(&signature))
            .expect("signature must verify");
    }

    #[test]
    fn payload_signature_is_insertion_order_independent() {
        let identity = SigningIdentity::generate().expect("generate");
        let mut a = BTreeMap::new();
        a.insert("status".to_string(), json!("in_progress"));
        a.insert("job_id".to_string(), json!("j-1"));
        let mut b = BTreeMap::new();
        b.insert("job_id".to_string(), json!("j-1"));
        b.insert("status".to_string(), json!("in_progress"));

        let sig_a = identity.sign_payload(&a).expect("sign");
        let sig_b = identity.sign_payload(&b).expect("sign");
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn distinct_identities_have_distinct_public_keys() {
        let a = SigningIdentity::generate().expect("generate");
        let b = SigningIdentity::generate().expect("generate");
        assert_ne!(a.public_key_base64(), b.public_key_base64());
    }
}
