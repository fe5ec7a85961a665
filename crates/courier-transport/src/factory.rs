use crate::{
    amqp::AmqpTransport, http_client::HttpTransport, local::LocalTransport, shared::TransportCore,
};
use courier_error::TransportError;
use courier_types::{
    Transport,
    settings::{TransportKind, TransportSettings},
};
use std::sync::Arc;
use tracing::info;

/// Builds the configured backend. AMQP connects before returning.
pub async fn create_transport(
    settings: &TransportSettings,
) -> Result<Arc<dyn Transport>, TransportError> {
    let core = TransportCore::from_settings(settings)?;

    let transport: Arc<dyn Transport> = match settings.kind {
        TransportKind::Local => Arc::new(LocalTransport::new(core)),
        TransportKind::Http => {
            let http = settings
                .http
                .clone()
                .ok_or_else(|| TransportError::invalid_data("missing `http` transport settings"))?;
            Arc::new(HttpTransport::new(http, core)?)
        }
        TransportKind::Amqp => {
            let amqp = settings
                .amqp
                .clone()
                .ok_or_else(|| TransportError::invalid_data("missing `amqp` transport settings"))?;
            Arc::new(AmqpTransport::connect(amqp, core).await?)
        }
    };

    info!(kind = ?settings.kind, "transport created");
    Ok(transport)
}
