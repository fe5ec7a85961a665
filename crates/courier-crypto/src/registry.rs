use crate::{
    ed25519::Ed25519Strategy,
    manager::TransportCryptoManager,
    rsa::RsaStrategy,
    strategy::{CryptoError, CryptoStrategy},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// Strategies by algorithm name. Lookups ignore case.
#[derive(Clone, Default)]
pub struct CryptoRegistry {
    strategies: HashMap<String, Arc<dyn CryptoStrategy>>,
}

impl CryptoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Ed25519 and RSA strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Ed25519Strategy));
        registry.register(Arc::new(RsaStrategy));
        registry
    }

    /// Adds a strategy, replacing any previous one for the same algorithm.
    pub fn register(&mut self, strategy: Arc<dyn CryptoStrategy>) {
        self.strategies
            .insert(strategy.algorithm().to_ascii_lowercase(), strategy);
    }

    pub fn get(&self, algorithm: &str) -> Result<Arc<dyn CryptoStrategy>, CryptoError> {
        self.strategies
            .get(&algorithm.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CryptoError::UnknownAlgorithm(algorithm.to_string()))
    }

    pub fn manager(&self, algorithm: &str) -> Result<TransportCryptoManager, CryptoError> {
        Ok(TransportCryptoManager::new(self.get(algorithm)?))
    }

    pub fn algorithms(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.strategies.values().map(|s| s.algorithm()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CryptoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoRegistry")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}
