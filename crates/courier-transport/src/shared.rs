use crate::pending::{PendingRegistry, Registration};
use courier_crypto::{CryptoRegistry, KeyPair, TransportCryptoManager, new_nonce};
use courier_error::TransportError;
use courier_types::{
    Command, CommandOptions, PendingReply, Signature,
    protocol::RequestEnvelope,
    settings::{CryptoSettings, TransportSettings},
};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    time::{self, Instant},
};
use tracing::{debug, warn};

struct Signer {
    manager: TransportCryptoManager,
    key_pair: KeyPair,
}

struct Verifier {
    manager: TransportCryptoManager,
    require_signature: bool,
}

/// State and rules every backend shares: the pending registry, timeouts and
/// envelope signing.
pub struct TransportCore {
    pending: Arc<PendingRegistry>,
    default_timeout: Duration,
    signer: Option<Signer>,
    verifier: Option<Verifier>,
}

impl TransportCore {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(PendingRegistry::new()),
            default_timeout,
            signer: None,
            verifier: None,
        }
    }

    pub fn from_settings(settings: &TransportSettings) -> Result<Self, TransportError> {
        let core = Self::new(settings.default_timeout());
        match &settings.crypto {
            Some(crypto) => core.with_crypto(&CryptoRegistry::with_defaults(), crypto),
            None => Ok(core),
        }
    }

    pub fn with_crypto(
        mut self,
        registry: &CryptoRegistry,
        settings: &CryptoSettings,
    ) -> Result<Self, TransportError> {
        let manager = registry.manager(&settings.algorithm)?;

        if let (Some(private_key), Some(public_key)) = (&settings.private_key, &settings.public_key)
        {
            self = self.with_signer(
                manager.clone(),
                KeyPair::new(public_key.clone(), private_key.clone()),
            );
        }
        if settings.verify_incoming || settings.require_signature {
            self = self.with_verifier(manager, settings.require_signature);
        }
        Ok(self)
    }

    pub fn with_signer(mut self, manager: TransportCryptoManager, key_pair: KeyPair) -> Self {
        self.signer = Some(Signer { manager, key_pair });
        self
    }

    pub fn with_verifier(mut self, manager: TransportCryptoManager, require_signature: bool) -> Self {
        self.verifier = Some(Verifier {
            manager,
            require_signature,
        });
        self
    }

    pub fn pending(&self) -> &PendingRegistry {
        &self.pending
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Fills in the default timeout.
    pub fn options(&self, options: Option<CommandOptions>) -> CommandOptions {
        let mut options = options.unwrap_or_default();
        options.timeout.get_or_insert(self.default_timeout);
        options
    }

    pub fn timeout_for(&self, options: &CommandOptions) -> Duration {
        options.timeout.unwrap_or(self.default_timeout)
    }

    pub fn sign(&self, command: &Command) -> Result<Signature, TransportError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            TransportError::Crypto(format!(
                "no signing key configured for \"{}\" command",
                command.name()
            ))
        })?;
        Ok(signer
            .manager
            .sign(command, &new_nonce(), &signer.key_pair)?)
    }

    pub fn request_envelope(
        &self,
        command: &Command,
        options: &CommandOptions,
    ) -> Result<RequestEnvelope, TransportError> {
        let mut envelope = RequestEnvelope::new(command, options);
        if options.is_need_signature {
            envelope.signature = Some(self.sign(command)?);
        }
        Ok(envelope)
    }

    /// Validates a received envelope and checks its signature when a
    /// verifier is configured.
    pub fn accept_request(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<(Command, CommandOptions), TransportError> {
        let command = envelope.to_command()?;

        if let Some(verifier) = &self.verifier {
            match &envelope.signature {
                Some(signature) => {
                    let valid = verifier.manager.verify(&command, signature).map_err(|err| {
                        TransportError::invalid_data(format!(
                            "Unable to verify \"{}\" command signature: {err}",
                            command.name()
                        ))
                    })?;
                    if !valid {
                        return Err(TransportError::invalid_data(format!(
                            "Invalid signature for \"{}\" command",
                            command.name()
                        )));
                    }
                }
                None if verifier.require_signature => {
                    return Err(TransportError::invalid_data(format!(
                        "\"{}\" command is not signed",
                        command.name()
                    )));
                }
                None => {}
            }
        }

        Ok((command, envelope.options))
    }

    /// Registers the command, runs `dispatch` and waits for the reply under
    /// the command timeout. Exactly one of completion, dispatch failure or
    /// timeout settles the entry.
    pub async fn send_listen<F>(
        &self,
        command: &Command,
        options: &CommandOptions,
        dispatch: F,
    ) -> Result<Value, TransportError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let id = command.id();
        let reply = match self.pending.register(id, command.name()) {
            Registration::Existing(reply) => {
                debug!(command = %command.name(), id, "command is already pending");
                return reply.await;
            }
            Registration::New(reply) => reply,
        };

        let timeout = self.timeout_for(options);
        let mut guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.to_string(),
            name: command.name().to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            reply,
            armed: true,
        };
        let outcome = time::timeout(timeout, async {
            if let Err(err) = dispatch.await {
                self.pending.reject(id, err.clone());
                return Err(err);
            }
            (&mut guard.reply).await
        })
        .await;
        guard.armed = false;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let error = TransportError::Timeout {
                    name: command.name().to_string(),
                    id: id.to_string(),
                    timeout,
                };
                if self.pending.reject(id, error.clone()) {
                    warn!(
                        command = %command.name(),
                        id,
                        timeout_ms = timeout.as_millis() as u64,
                        "command timed out"
                    );
                    Err(error)
                } else {
                    // a completion won the race
                    (&mut guard.reply).await
                }
            }
        }
    }

    pub fn settle(&self, id: &str, result: Result<Value, TransportError>) -> bool {
        let settled = self.pending.settle(id, result);
        if !settled {
            warn!(id, "no pending command for response, dropping it");
        }
        settled
    }

    pub fn wait(&self, id: &str) -> Option<PendingReply> {
        self.pending.wait(id)
    }

    pub fn fail_all(&self, error: &TransportError) -> usize {
        let failed = self.pending.reject_all(error);
        if failed > 0 {
            warn!(failed, error = %error, "pending commands rejected");
        }
        failed
    }
}

/// Cleans up when the `send_listen` future is dropped early. An entry other
/// callers still wait on stays registered and times out at the original
/// deadline instead.
struct PendingGuard {
    pending: Arc<PendingRegistry>,
    id: String,
    name: String,
    timeout: Duration,
    deadline: Instant,
    reply: PendingReply,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.pending.remove_unshared(&self.id) {
            debug!(id = %self.id, "caller dropped pending command");
            return;
        }
        if !self.pending.contains(&self.id) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.pending.remove(&self.id);
            return;
        };
        debug!(id = %self.id, "caller dropped shared pending command");
        let pending = self.pending.clone();
        let deadline = self.deadline;
        let error = TransportError::Timeout {
            name: self.name.clone(),
            id: self.id.clone(),
            timeout: self.timeout,
        };
        let id = self.id.clone();
        runtime.spawn(async move {
            time::sleep_until(deadline).await;
            if pending.reject(&id, error) {
                warn!(id = %id, "shared pending command timed out");
            }
        });
    }
}
