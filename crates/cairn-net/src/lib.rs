//! Networking core of a Cairn storage node.
//!
//! Reactor threads assemble frames from non-blocking sockets. Requests go to
//! two worker pools that dispatch them against the object store, and replies
//! are matched to pending transactions. [`Node`] ties it together and
//! exposes the client API.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod node;
pub mod reactor;
pub mod registry;
pub mod transaction;
pub mod worker;

pub use config::NodeConfig;
pub use connection::{Connection, Inbound, RecvAssembler, SendQueue};
pub use dispatch::{CommandHandler, Dispatcher, Responder};
pub use error::{NetError, NetResult};
pub use exec::Executor;
pub use node::{Node, NodeBuilder, NodeContext, WriteIds};
pub use reactor::{ReactorHandle, ReactorPool, ReactorSettings};
pub use registry::{Owner, Registry};
pub use transaction::{channel, Callback, Reply, ReplyReceiver, TransactionSet};
pub use worker::{Envelope, Handler, Submitter, WorkerPool};
