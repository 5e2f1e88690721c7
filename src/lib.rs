//! hc-multiplexer - many UI clients, a few conductor connections
//!
//! Sits between browser UIs and one or more Holochain conductors. Each UI
//! client gets its own WebSocket; the multiplexer forwards their frames over a
//! small pool of app interface connections per conductor, routes each response
//! back to the client whose request carried its id, and fans conductor signals
//! out to every client of that conductor.
//!
//! ## Layout
//!
//! - **proxy**: frame inspection, upstream pool, client registry, request
//!   router and the per-conductor actor tying them together
//! - **conductor**: app interface dialer and admin API client
//! - **server**: per-conductor HTTP/WebSocket listeners and process wiring

pub mod conductor;
pub mod config;
pub mod proxy;
pub mod server;
pub mod types;

pub use config::{Args, ShardConfig};
pub use server::{run, start_shard, Shard};
pub use types::{MuxError, Result};
