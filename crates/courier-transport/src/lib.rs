pub mod amqp;
mod factory;
mod handler;
mod http_client;
mod local;
mod pending;
mod received;
mod retry;
mod shared;

pub use amqp::{AmqpConnector, AmqpLink, AmqpSession, AmqpTransport, LapinConnector};
pub use courier_types::{
    Command, CommandOptions, CommandStream, ErrorObject, EventStream, IncomingCommand,
    PendingReply, Transport, TransportError, TransportEvent, TransportExt,
};
pub use factory::create_transport;
pub use handler::{CommandHandler, HandlerError, serve};
pub use http_client::{HttpTransport, status_for_error};
pub use local::LocalTransport;
pub use pending::{PendingRegistry, Registration};
pub use retry::RetryPolicy;
pub use shared::TransportCore;
