//! BIP-340 Schnorr verification of event signatures.
//!
//! The signed message is the raw 32 bytes of the declared event id; no
//! additional hashing happens here. Whether the id matches the event body is
//! a separate concern (see [`crate::Event::has_valid_id`]).

use secp256k1::{schnorr::Signature, Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::short_hex;

/// Why a signature triple was rejected.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{field} is not valid hex: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("{field} must be lowercase hex")]
    Uppercase { field: &'static str },
    #[error("{field} must be {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid x-only public key: {0}")]
    PublicKey(#[source] secp256k1::Error),
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[source] secp256k1::Error),
    #[error("invalid message: {0}")]
    Message(#[source] secp256k1::Error),
    #[error("signature does not verify: {0}")]
    Mismatch(#[source] secp256k1::Error),
}

/// Stateless verifier holding a verification-only secp256k1 context.
pub struct SignatureVerifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }

    /// Fail-closed check: any malformed input or cryptographic rejection
    /// returns `false` and logs the reason.
    pub fn verify(&self, id: &str, pubkey: &str, sig: &str) -> bool {
        match self.check(id, pubkey, sig) {
            Ok(()) => {
                debug!("Verification successful for event {}", short_hex(id));
                true
            }
            Err(e) => {
                warn!("Verification failed for event {}: {}", short_hex(id), e);
                false
            }
        }
    }

    /// Same as [`SignatureVerifier::verify`] but reports why it failed.
    ///
    /// Only lowercase hex is accepted. The store compares ids and pubkeys as
    /// text, so a case variant would otherwise pass as a different event.
    pub fn check(&self, id: &str, pubkey: &str, sig: &str) -> Result<(), VerifyError> {
        let id = decode_fixed::<32>("id", id)?;
        let pubkey = decode_fixed::<32>("pubkey", pubkey)?;
        let sig = decode_fixed::<64>("sig", sig)?;

        // x-only keys are lifted to the even-y point per BIP-340.
        let pk = XOnlyPublicKey::from_slice(&pubkey).map_err(VerifyError::PublicKey)?;
        let sig = Signature::from_slice(&sig).map_err(VerifyError::SignatureEncoding)?;
        let msg = Message::from_digest_slice(&id).map_err(VerifyError::Message)?;

        self.secp
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(VerifyError::Mismatch)
    }
}

fn decode_fixed<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], VerifyError> {
    if value.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(VerifyError::Uppercase { field });
    }
    let bytes = hex::decode(value).map_err(|source| VerifyError::Hex { field, source })?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| VerifyError::Length {
        field,
        expected: N,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Author;

    const ID: &str = "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36";

    #[test]
    fn valid_signature_verifies() {
        let alice = Author::new(1);
        let pubkey = alice.pubkey.clone();
        let sig = alice.sign(ID);
        assert!(SignatureVerifier::new().verify(ID, &pubkey, &sig));
    }

    #[test]
    fn signature_fails_under_other_pubkey() {
        let sig = Author::new(1).sign(ID);
        let other = Author::new(2).pubkey;
        let verifier = SignatureVerifier::new();
        assert!(!verifier.verify(ID, &other, &sig));
        assert!(matches!(
            verifier.check(ID, &other, &sig),
            Err(VerifyError::Mismatch(_))
        ));
    }

    #[test]
    fn signature_fails_for_other_id() {
        let alice = Author::new(1);
        let pubkey = alice.pubkey.clone();
        let sig = alice.sign(ID);
        let other_id = "ff".repeat(32);
        assert!(!SignatureVerifier::new().verify(&other_id, &pubkey, &sig));
    }

    #[test]
    fn every_id_byte_matters() {
        let carol = Author::new(3);
        let pubkey = carol.pubkey.clone();
        let verifier = SignatureVerifier::new();
        for seed in 1u8..9 {
            let id = hex::encode([seed; 32]);
            let sig = carol.sign(&id);
            assert!(verifier.verify(&id, &pubkey, &sig));

            let mut flipped = [seed; 32];
            flipped[31] ^= 0x01;
            assert!(!verifier.verify(&hex::encode(flipped), &pubkey, &sig));
        }
    }

    #[test]
    fn malformed_hex_fails_closed() {
        let alice = Author::new(1);
        let pubkey = alice.pubkey.clone();
        let sig = alice.sign(ID);
        let verifier = SignatureVerifier::new();

        assert!(matches!(
            verifier.check("zz", &pubkey, &sig),
            Err(VerifyError::Hex { field: "id", .. })
        ));
        assert!(matches!(
            verifier.check(ID, &pubkey[..62], &sig),
            Err(VerifyError::Length { field: "pubkey", expected: 32, actual: 31 })
        ));
        assert!(matches!(
            verifier.check(ID, &pubkey, &sig[..126]),
            Err(VerifyError::Length { field: "sig", .. })
        ));
        assert!(!verifier.verify("", "", ""));
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let alice = Author::new(1);
        let pubkey = alice.pubkey.clone();
        let sig = alice.sign(ID);
        let verifier = SignatureVerifier::new();
        assert!(verifier.verify(ID, &pubkey, &sig));

        assert!(matches!(
            verifier.check(&ID.to_uppercase(), &pubkey, &sig),
            Err(VerifyError::Uppercase { field: "id" })
        ));
        assert!(matches!(
            verifier.check(ID, &pubkey.to_uppercase(), &sig),
            Err(VerifyError::Uppercase { field: "pubkey" })
        ));
        assert!(!verifier.verify(ID, &pubkey, &sig.to_uppercase()));
    }

    #[test]
    fn point_not_on_curve_is_rejected() {
        let sig = Author::new(1).sign(ID);
        // x >= field prime is not a valid coordinate.
        let bad_pubkey = "ff".repeat(32);
        assert!(matches!(
            SignatureVerifier::new().check(ID, &bad_pubkey, &sig),
            Err(VerifyError::PublicKey(_))
        ));
    }

    #[test]
    fn zeroed_signature_is_rejected() {
        let pubkey = Author::new(1).pubkey;
        let sig = "00".repeat(64);
        assert!(!SignatureVerifier::new().verify(ID, &pubkey, &sig));
    }
}
