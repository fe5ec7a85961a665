pub mod command;
pub mod protocol;
pub mod settings;
pub mod transport;

pub use command::{Command, CommandOptions, Signature, TransportEvent};
pub use courier_error::{ErrorObject, TransportError};
pub use transport::{
    CommandResponder, CommandStream, EventStream, IncomingCommand, PendingReply, Transport,
    TransportExt,
};
