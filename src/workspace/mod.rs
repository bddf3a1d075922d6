//! Workspace state machine (§4.5).
//!
//! One `Workspace` per collaboration space the user has joined or is
//! joining. `state` holds the data model, `machine` drives `run_pass` and
//! the login cascade, `apps` is the tagged-sum application dispatch table,
//! and `notify` implements the FIFO-under-lock-count notification queue.

pub mod apps;
pub mod machine;
pub mod notify;
pub mod state;

pub use apps::App;
pub use notify::{Notification, NotificationQueue};
pub use state::{Credentials, CurrentTask, LoginStatus, RunLevel, UserTask, Workspace};
