use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::{commit_str, Call};
use crate::ledger::{Digest, Principal};

/// A call authenticated by the ed25519 key of its caller.
///
/// The signature covers the asset tag, the nonce and the call, so the same
/// envelope cannot be redirected to another ledger or replayed with a new
/// nonce.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedCall {
    pub asset: String,
    pub nonce: u64,
    pub call: Call,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedCall {
    pub fn sign(asset: &str, call: Call, nonce: u64, key: &SigningKey) -> Self {
        let public_key = key.verifying_key().to_bytes().to_vec();
        let message = signing_digest(asset, nonce, &call, &public_key);
        let signature = key.sign(&message);
        Self {
            asset: asset.to_string(),
            nonce,
            call,
            public_key,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Identifier of this envelope, used for replay protection.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(signing_digest(
            &self.asset,
            self.nonce,
            &self.call,
            &self.public_key,
        ));
        hasher.update(&self.signature);
        hasher.finalize().into()
    }

    /// Checks the signature and returns the principal that signed.
    pub fn verify(&self) -> Result<Principal, VerificationError> {
        let key_bytes: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| VerificationError::MalformedKey)?;
        let key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| VerificationError::MalformedKey)?;
        let principal = Principal::from_verifying_key(&key);
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| VerificationError::MalformedSignature(principal.clone()))?;
        let message = signing_digest(&self.asset, self.nonce, &self.call, &self.public_key);
        key.verify_strict(&message, &signature)
            .map_err(|_| VerificationError::InvalidSignature(principal.clone()))?;
        Ok(principal)
    }
}

fn signing_digest(asset: &str, nonce: u64, call: &Call, public_key: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(b"ramu-call");
    commit_str(&mut hasher, asset);
    hasher.update(nonce.to_le_bytes());
    hasher.update(public_key);
    call.commit(&mut hasher);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("malformed public key")]
    MalformedKey,
    #[error("malformed signature from {0}")]
    MalformedSignature(Principal),
    #[error("invalid signature from {0}")]
    InvalidSignature(Principal),
}

mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn transfer_to(recipient: &str) -> Call {
        Call::Transfer {
            amount: 42,
            sender: "ignored-by-signature".into(),
            recipient: recipient.into(),
            memo: Some("rent".into()),
        }
    }

    #[test]
    fn signature_resolves_to_key_principal() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedCall::sign("ramu-fungible-token", transfer_to("bob"), 7, &key);
        let principal = signed.verify().unwrap();
        assert_eq!(principal, Principal::from_verifying_key(&key.verifying_key()));
        assert!(principal.as_str().starts_with("ST"));
        assert_eq!(principal.as_str().len(), 42);
    }

    #[test]
    fn tampered_call_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = SignedCall::sign("ramu-fungible-token", transfer_to("bob"), 7, &key);
        signed.call = transfer_to("mallory");
        assert!(matches!(
            signed.verify(),
            Err(VerificationError::InvalidSignature(_))
        ));
    }

    #[test]
    fn nonce_changes_envelope_digest() {
        let key = SigningKey::generate(&mut OsRng);
        let a = SignedCall::sign("ramu-fungible-token", Call::Burn { amount: 1 }, 1, &key);
        let b = SignedCall::sign("ramu-fungible-token", Call::Burn { amount: 1 }, 2, &key);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn malformed_material_is_reported() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = SignedCall::sign("ramu-fungible-token", Call::GetTotalSupply, 0, &key);
        signed.signature.truncate(10);
        assert!(matches!(
            signed.verify(),
            Err(VerificationError::MalformedSignature(_))
        ));
        signed.public_key = vec![1, 2, 3];
        assert!(matches!(signed.verify(), Err(VerificationError::MalformedKey)));
    }

    #[test]
    fn envelope_json_hex_encodes_bytes() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedCall::sign("ramu-fungible-token", Call::Burn { amount: 3 }, 0, &key);
        let json = serde_json::to_string(&signed).unwrap();
        assert!(json.contains(&hex::encode(&signed.public_key)));
        let back: SignedCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signed);
        back.verify().unwrap();
    }
}
