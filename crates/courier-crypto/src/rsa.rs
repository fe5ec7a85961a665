use crate::strategy::{CryptoError, CryptoStrategy, KeyPair};
use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::MessageDigest,
    pkey::PKey,
    rsa::Rsa,
    sign::{Signer, Verifier},
};

const KEY_BITS: u32 = 2048;

/// RSA PKCS#1 v1.5 over SHA-256. Keys are PEM, signatures base64.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaStrategy;

impl RsaStrategy {
    pub const ALGORITHM: &'static str = "RSA";
}

impl CryptoStrategy for RsaStrategy {
    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn sign(&self, message: &[u8], private_key: &str) -> Result<String, CryptoError> {
        let key = PKey::private_key_from_pem(private_key.as_bytes())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;

        let mut signer = Signer::new(MessageDigest::sha256(), &key)
            .map_err(|err| CryptoError::Sign(err.to_string()))?;
        signer
            .update(message)
            .map_err(|err| CryptoError::Sign(err.to_string()))?;
        let signature = signer
            .sign_to_vec()
            .map_err(|err| CryptoError::Sign(err.to_string()))?;
        Ok(STANDARD.encode(signature))
    }

    fn verify(
        &self,
        message: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, CryptoError> {
        let key = PKey::public_key_from_pem(public_key.as_bytes())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;

        let Ok(signature) = STANDARD.decode(signature.trim()) else {
            return Ok(false);
        };
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        if verifier.update(message).is_err() {
            return Ok(false);
        }
        Ok(verifier.verify(&signature).unwrap_or(false))
    }

    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let rsa = Rsa::generate(KEY_BITS).map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
        let key = PKey::from_rsa(rsa).map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;

        let private_key = key
            .private_key_to_pem_pkcs8()
            .map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
        let public_key = key
            .public_key_to_pem()
            .map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;

        Ok(KeyPair::new(
            String::from_utf8_lossy(&public_key).into_owned(),
            String::from_utf8_lossy(&private_key).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies_with_pem_keys() {
        let strategy = RsaStrategy;
        let keys = strategy.generate_key_pair().unwrap();
        assert!(keys.public_key.starts_with("-----BEGIN PUBLIC KEY-----"));

        let signature = strategy.sign(b"payload", &keys.private_key).unwrap();
        assert!(strategy.verify(b"payload", &signature, &keys.public_key).unwrap());
        assert!(!strategy.verify(b"payload!", &signature, &keys.public_key).unwrap());
    }

    #[test]
    fn unusable_public_key_is_an_error() {
        let strategy = RsaStrategy;
        assert!(strategy.verify(b"payload", "AAAA", "not a pem").is_err());
    }
}
