//! In-process duplex transports and a capability RPC session engine.
//!
//! # Layout
//!
//! - [`duplex`]: linked endpoint pairs with FIFO delivery and a single pending receiver.
//! - [`socket`]: adapts callback-driven sockets into a pull-based [`RpcTransport`].
//! - [`session`]: the engine. Exports, imports, reference counting, call dispatch.
//! - [`connection`]: the client facade. Pair a server and client in one call, then call
//!   methods, duplicate handles and read session counters.
//!
//! ```ignore
//! let api = TargetBuilder::new()
//! 	.method("ping", |args, _ctx| async move { Ok(json!(format!("pong: {}", args[0]))) })
//! 	.build();
//! let conn = Connection::connect_pair(api);
//! conn.call1("ping", "hi").await?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod duplex;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod stub;
pub mod target;
pub mod transport;

pub use config::SessionConfig;
pub use connection::Connection;
pub use duplex::{Endpoint, pair};
pub use error::{Error, Result, TransportError};
pub use events::{EventBus, ListenerId};
pub use session::{CallContext, RpcSession, SessionStats, serve};
pub use socket::{PushSocket, PushSocketTransport};
pub use stub::Stub;
pub use target::{Disposable, DisposableTarget, MethodTable, RpcTarget, TargetBuilder, from_fn};
pub use transport::RpcTransport;
