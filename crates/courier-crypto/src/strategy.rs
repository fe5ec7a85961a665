use courier_error::TransportError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unable to find crypto strategy for \"{0}\" algorithm")]
    UnknownAlgorithm(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

impl From<CryptoError> for TransportError {
    fn from(err: CryptoError) -> Self {
        TransportError::Crypto(err.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl KeyPair {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One signature algorithm. Keys and signature values travel as strings so
/// every strategy yields the same `Signature` shape.
pub trait CryptoStrategy: Send + Sync {
    fn algorithm(&self) -> &'static str;

    fn sign(&self, message: &[u8], private_key: &str) -> Result<String, CryptoError>;

    /// `Ok(false)` for a signature that does not match or cannot be decoded;
    /// `Err` only when the public key itself is unusable.
    fn verify(&self, message: &[u8], signature: &str, public_key: &str)
    -> Result<bool, CryptoError>;

    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError>;
}
