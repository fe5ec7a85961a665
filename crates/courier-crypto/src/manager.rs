use crate::strategy::{CryptoError, CryptoStrategy, KeyPair};
use courier_types::{Command, Signature};
use serde_json::Value;
use std::{fmt, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// The string a command signature covers: name, compact JSON of the request
/// (empty when there is none) and the nonce, concatenated.
///
/// `serde_json` keeps object keys sorted, so both sides derive the same
/// bytes from equal requests.
pub fn canonical_string(command: &Command, nonce: &str) -> String {
    let request = match command.request() {
        Value::Null => String::new(),
        request => request.to_string(),
    };
    format!("{}{}{}", command.name(), request, nonce)
}

pub fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Signs and verifies commands with one strategy.
#[derive(Clone)]
pub struct TransportCryptoManager {
    strategy: Arc<dyn CryptoStrategy>,
}

impl TransportCryptoManager {
    pub fn new(strategy: Arc<dyn CryptoStrategy>) -> Self {
        Self { strategy }
    }

    pub fn algorithm(&self) -> &'static str {
        self.strategy.algorithm()
    }

    pub fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        self.strategy.generate_key_pair()
    }

    pub fn sign(
        &self,
        command: &Command,
        nonce: &str,
        key_pair: &KeyPair,
    ) -> Result<Signature, CryptoError> {
        let message = canonical_string(command, nonce);
        let value = self.strategy.sign(message.as_bytes(), &key_pair.private_key)?;
        Ok(Signature {
            value,
            nonce: nonce.to_string(),
            public_key: key_pair.public_key.clone(),
        })
    }

    pub fn verify(&self, command: &Command, signature: &Signature) -> Result<bool, CryptoError> {
        let message = canonical_string(command, &signature.nonce);
        let valid =
            self.strategy
                .verify(message.as_bytes(), &signature.value, &signature.public_key)?;
        if !valid {
            debug!(
                id = command.id(),
                name = command.name(),
                algorithm = self.algorithm(),
                "signature mismatch"
            );
        }
        Ok(valid)
    }
}

impl fmt::Debug for TransportCryptoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCryptoManager")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CryptoRegistry;
    use serde_json::json;

    #[test]
    fn canonical_string_skips_null_request() {
        let command = Command::with_id("1", "ping", Value::Null).unwrap();
        assert_eq!(canonical_string(&command, "n"), "pingn");

        let command = Command::with_id("1", "add", json!({ "b": 2, "a": 1 })).unwrap();
        assert_eq!(canonical_string(&command, "n"), r#"add{"a":1,"b":2}n"#);
    }

    #[test]
    fn tampering_breaks_the_signature() {
        for algorithm in ["Ed25519", "RSA"] {
            let manager = CryptoRegistry::with_defaults().manager(algorithm).unwrap();
            let keys = manager.generate_key_pair().unwrap();
            let command = Command::with_id("1", "transfer", json!({ "amount": 10 })).unwrap();
            let nonce = new_nonce();

            let signature = manager.sign(&command, &nonce, &keys).unwrap();
            assert!(manager.verify(&command, &signature).unwrap());

            let renamed = Command::with_id("1", "transfer2", json!({ "amount": 10 })).unwrap();
            assert!(!manager.verify(&renamed, &signature).unwrap());

            let altered = Command::with_id("1", "transfer", json!({ "amount": 11 })).unwrap();
            assert!(!manager.verify(&altered, &signature).unwrap());

            let replayed = Signature {
                nonce: new_nonce(),
                ..signature.clone()
            };
            assert!(!manager.verify(&command, &replayed).unwrap());
        }
    }
}
