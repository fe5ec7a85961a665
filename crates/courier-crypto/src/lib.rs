mod ed25519;
mod manager;
mod registry;
mod rsa;
mod strategy;

pub use ed25519::Ed25519Strategy;
pub use manager::{TransportCryptoManager, canonical_string, new_nonce};
pub use registry::CryptoRegistry;
pub use rsa::RsaStrategy;
pub use strategy::{CryptoError, CryptoStrategy, KeyPair};
