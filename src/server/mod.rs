//! Server connection handling (§4.3, §4.6).
//!
//! `handle` holds the coordinator-side view of a server (connection status,
//! the set of workspaces wanting it connected, reconnect bookkeeping).
//! `query` correlates outstanding command/reply pairs by message id.
//! `broker` is the dedicated worker thread that actually owns the
//! transport and the `mio` readiness multiplexer.

pub mod broker;
pub mod handle;
pub mod query;

pub use broker::{BrokerToManager, ManagerToBroker, Quench, ServerConnectionBroker};
pub use handle::{ConnStatus, ServerHandle};
pub use query::{ServerQuery, QueryMap};
