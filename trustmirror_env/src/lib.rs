//! trustmirror Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the synchronization
//! engine run against a real WebSocket endpoint in **Production** and
//! against scripted, seeded transports in **Simulation**.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything non-deterministic the engine touches is behind a trait:
//! - Time (`now()`, `sleep()`)
//! - Randomness (`random_unit()` for backoff jitter, `derive_session_id()`)
//! - Transport (`connect()`, `send()`, `recv()`, `close()`)
//!
//! Under a paused tokio clock and a seeded context, a whole reconnect storm
//! replays identically from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use trustmirror_env::{Connection, MirrorContext, Transport};
//!
//! async fn pump<Ctx: MirrorContext, T: Transport>(ctx: &Ctx, transport: &T) {
//!     let mut conn = transport.connect("ws://localhost:8080").await?;
//!     loop {
//!         tokio::select! {
//!             frame = conn.recv() => handle(frame),
//!             _ = ctx.sleep(Duration::from_secs(30)) => probe(&mut conn).await,
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod memory_impl;
mod tokio_impl;
mod transport;
mod types;
mod ws_impl;

pub use context::MirrorContext;
pub use error::EnvError;
pub use memory_impl::{Admission, MemoryConnection, MemoryPeer, MemoryTransport};
pub use tokio_impl::TokioContext;
pub use transport::{Connection, Transport};
pub use types::SessionId;
pub use ws_impl::{WsConnection, WsTransport};
