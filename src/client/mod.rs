//! External-client broker (§4.7, §5).
//!
//! A third worker alongside the server-connection broker (§4.3) and the
//! crypto-helper broker (§4.4), but hosted on a tokio runtime instead of a
//! raw `mio::Poll` loop — accepting Unix-domain-socket clients is exactly
//! the kind of many-short-lived-tasks workload tokio is built for, and §5
//! calls for it explicitly. It still talks to the coordinator exclusively
//! through a `std::sync::mpsc` pair, the same as the other two brokers, so
//! the coordinator never has to know which worker runs an async runtime
//! and which runs a bare OS thread.

pub mod command;
pub mod conn;

pub use command::{ChannelId, ClientCommand, ClientEvent, ClientReply, ErrorKind, RequestId};
pub use conn::ExternalClientBroker;

/// Coordinator -> broker.
#[derive(Debug)]
pub enum ManagerToClientBroker {
    /// Fire-and-forget push (§4.7). Delivered best-effort; if the channel
    /// can't drain its write queue it is closed instead of retried.
    Push(ChannelId, ClientEvent),
    /// Reply to exactly one outstanding command.
    Reply(ChannelId, RequestId, ClientReply),
    /// Forcibly closes a channel, e.g. because the workspace it was
    /// subscribed to was deleted.
    CloseChannel(ChannelId),
    Shutdown,
}

/// Broker -> coordinator.
#[derive(Debug)]
pub enum ClientBrokerToManager {
    ChannelConnected(ChannelId),
    ChannelDisconnected(ChannelId),
    Command(ChannelId, RequestId, ClientCommand),
}
