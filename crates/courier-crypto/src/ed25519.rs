use crate::strategy::{CryptoError, CryptoStrategy, KeyPair};
use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    pkey::{Id, PKey},
    sign::{Signer, Verifier},
};

/// Ed25519 with raw 32-byte keys, base64 encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Strategy;

impl Ed25519Strategy {
    pub const ALGORITHM: &'static str = "Ed25519";
}

impl CryptoStrategy for Ed25519Strategy {
    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn sign(&self, message: &[u8], private_key: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(private_key.trim())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        let key = PKey::private_key_from_raw_bytes(&raw, Id::ED25519)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;

        let mut signer =
            Signer::new_without_digest(&key).map_err(|err| CryptoError::Sign(err.to_string()))?;
        let signature = signer
            .sign_oneshot_to_vec(message)
            .map_err(|err| CryptoError::Sign(err.to_string()))?;
        Ok(STANDARD.encode(signature))
    }

    fn verify(
        &self,
        message: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, CryptoError> {
        let raw = STANDARD
            .decode(public_key.trim())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        let key = PKey::public_key_from_raw_bytes(&raw, Id::ED25519)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;

        let Ok(signature) = STANDARD.decode(signature.trim()) else {
            return Ok(false);
        };
        let mut verifier = Verifier::new_without_digest(&key)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        Ok(verifier.verify_oneshot(&signature, message).unwrap_or(false))
    }

    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let key =
            PKey::generate_ed25519().map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
        let private_key = key
            .raw_private_key()
            .map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
        let public_key = key
            .raw_public_key()
            .map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
        Ok(KeyPair::new(
            STANDARD.encode(public_key),
            STANDARD.encode(private_key),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies() {
        let strategy = Ed25519Strategy;
        let keys = strategy.generate_key_pair().unwrap();
        let signature = strategy.sign(b"message", &keys.private_key).unwrap();

        assert!(strategy.verify(b"message", &signature, &keys.public_key).unwrap());
        assert!(!strategy.verify(b"massage", &signature, &keys.public_key).unwrap());
        assert!(!strategy.verify(b"message", "not base64!", &keys.public_key).unwrap());
    }

    #[test]
    fn rejects_malformed_keys() {
        let strategy = Ed25519Strategy;
        assert!(matches!(
            strategy.sign(b"message", "AAAA"),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
