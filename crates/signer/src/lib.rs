//! Availability attestation signing.
//!
//! The committee member's private key lives behind [`AttestationSigner`],
//! which only signs canonical availability claims; there is no raw-bytes
//! signing surface. Signatures are deterministic ECDSA (RFC-6979 nonces)
//! over secp256k1, so re-signing the same claim reproduces identical bytes.

use std::path::Path;

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use merkle::Hash32;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain-separation prefix of the claim hash.
const CLAIM_DOMAIN: &[u8] = b"availability_claim";

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("reading key file: {0}")]
    KeyFile(#[from] std::io::Error),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("invalid member key: {0}")]
    InvalidMemberKey(String),
}

/// The canonical statement a committee member attests to: a batch id bound
/// to the roots (and heights) of the trees it verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityClaim {
    pub batch_id: i64,
    pub state_root: Hash32,
    pub state_height: u64,
    pub order_root: Hash32,
    pub order_height: u64,
}

impl AvailabilityClaim {
    /// The signed message. Heights are bound so a claim over a tree of one
    /// geometry can never be replayed against another.
    pub fn preimage(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(CLAIM_DOMAIN.len() + 8 + 32 + 8 + 32 + 8);
        message.extend_from_slice(CLAIM_DOMAIN);
        message.extend_from_slice(&self.batch_id.to_be_bytes());
        message.extend_from_slice(&self.state_root);
        message.extend_from_slice(&self.state_height.to_be_bytes());
        message.extend_from_slice(&self.order_root);
        message.extend_from_slice(&self.order_height.to_be_bytes());
        message
    }

    pub fn hash(&self) -> Hash32 {
        let mut hasher = Sha256::new();
        hasher.update(self.preimage());
        hasher.finalize().into()
    }
}

/// A signed availability attestation, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub batch_id: i64,
    /// Hex claim hash, for the gateway's expected-claim validation.
    pub claim_hash: String,
    /// Hex `r ‖ s` signature.
    pub signature: String,
    /// Hex SEC1-compressed public key identifying the member.
    pub member_key: String,
}

/// Holder of the member's signing key.
pub struct AttestationSigner {
    key: SigningKey,
}

impl AttestationSigner {
    /// Loads a key from a hex string (with or without `0x`).
    pub fn from_hex(hex_key: &str) -> Result<Self, SignerError> {
        let digits = hex_key.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Loads a key from a file holding the hex key, trailing newline
    /// tolerated.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_hex(&contents)
    }

    /// The member's public identity as sent to the gateway.
    pub fn member_key(&self) -> String {
        hex::encode(
            self.key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        )
    }

    /// Signs an availability claim. Deterministic: the same claim always
    /// yields the same signature bytes.
    pub fn sign(&self, claim: &AvailabilityClaim) -> Attestation {
        let signature: Signature = self.key.sign(&claim.preimage());
        Attestation {
            batch_id: claim.batch_id,
            claim_hash: hex::encode(claim.hash()),
            signature: hex::encode(signature.to_bytes()),
            member_key: self.member_key(),
        }
    }
}

/// Verifies an attestation signature against a member key and the canonical
/// claim schema. Returns `Ok(false)` for a well-formed but wrong signature.
pub fn verify_attestation(
    member_key: &str,
    claim: &AvailabilityClaim,
    signature: &str,
) -> Result<bool, SignerError> {
    let key_bytes =
        hex::decode(member_key).map_err(|e| SignerError::InvalidMemberKey(e.to_string()))?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| SignerError::InvalidMemberKey(e.to_string()))?;
    let sig_bytes =
        hex::decode(signature).map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    Ok(verifying_key.verify(&claim.preimage(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0xbfb1d570ddf495e378a1a85140e72d177a92637223fa540e05aaa061179f4290";

    fn claim() -> AvailabilityClaim {
        AvailabilityClaim {
            batch_id: 0,
            state_root: [0x11; 32],
            state_height: 31,
            order_root: [0x22; 32],
            order_height: 31,
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let first = signer.sign(&claim());
        let second = signer.sign(&claim());
        assert_eq!(first, second);
    }

    #[test]
    fn test_attestation_verifies_under_member_key() {
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let attestation = signer.sign(&claim());
        assert!(verify_attestation(
            &attestation.member_key,
            &claim(),
            &attestation.signature
        )
        .unwrap());
    }

    #[test]
    fn test_claim_binds_every_field() {
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let attestation = signer.sign(&claim());

        let variants = [
            AvailabilityClaim {
                batch_id: 1,
                ..claim()
            },
            AvailabilityClaim {
                state_root: [0x12; 32],
                ..claim()
            },
            AvailabilityClaim {
                state_height: 32,
                ..claim()
            },
            AvailabilityClaim {
                order_root: [0x23; 32],
                ..claim()
            },
            AvailabilityClaim {
                order_height: 64,
                ..claim()
            },
        ];
        for variant in variants {
            assert_ne!(variant.hash(), claim().hash());
            assert!(!verify_attestation(
                &attestation.member_key,
                &variant,
                &attestation.signature
            )
            .unwrap());
        }
    }

    #[test]
    fn test_claim_hash_has_domain_prefix() {
        let preimage = claim().preimage();
        assert!(preimage.starts_with(b"availability_claim"));
        assert_eq!(preimage.len(), 18 + 8 + 32 + 8 + 32 + 8);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(AttestationSigner::from_hex("0xzz").is_err());
        assert!(AttestationSigner::from_hex("0x11").is_err());
        // The zero scalar is not a valid secp256k1 key.
        assert!(AttestationSigner::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_key_file_tolerates_trailing_newline() {
        let path = std::env::temp_dir().join("committee-signer-key-test.txt");
        std::fs::write(&path, format!("{TEST_KEY}\n")).unwrap();
        let from_file = AttestationSigner::from_key_file(&path).unwrap();
        let from_hex = AttestationSigner::from_hex(TEST_KEY).unwrap();
        assert_eq!(from_file.member_key(), from_hex.member_key());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_member_key_is_compressed_sec1() {
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let key = hex::decode(signer.member_key()).unwrap();
        assert_eq!(key.len(), 33);
        assert!(key[0] == 0x02 || key[0] == 0x03);
    }
}
