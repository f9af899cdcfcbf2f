//! frame_rpc - messaging between isolated execution contexts
//!
//! Contexts form a tree (a top-level document and its nested frames) and can
//! only exchange asynchronous, fire-and-forget messages with each other. This
//! crate layers three things on top of that primitive:
//!
//! - [`Discovery`]: a token handshake that lets one server context find every
//!   client context in its tree.
//! - [`Channel`]: request/response RPC between exactly two contexts.
//! - [`Bridge`]: fan-out calls over every discovered channel, with a per-call
//!   timeout and shared method handlers.
//!
//! # Example
//!
//! ```no_run
//! use frame_rpc::{Bridge, BridgeConfig, ContextTree, Discovery, DiscoveryOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tree = ContextTree::new();
//!     let sidebar = tree.create_top("https://sidebar.example");
//!
//!     let bridge = Bridge::new(sidebar.clone(), BridgeConfig::default());
//!     bridge
//!         .on("ping", |_, _, reply| reply.ok(serde_json::json!("pong")))
//!         .unwrap();
//!
//!     let discovery = Discovery::new(sidebar, DiscoveryOptions::server());
//!     let links = bridge.clone();
//!     discovery
//!         .start_discovery(move |peer, origin, token| {
//!             let _ = links.create_channel(peer, &origin, &token);
//!         })
//!         .unwrap();
//!
//!     let replies = bridge.call("getDocumentInfo", vec![]).wait().await;
//!     println!("{replies:?}");
//! }
//! ```

pub mod bridge;
pub mod channel;
pub mod context;
pub mod discovery;
mod error;

pub use bridge::{Bridge, BridgeConfig, CallResult, DEFAULT_CALL_TIMEOUT, Link, PendingCall};
pub use channel::{CallContext, Channel, Handler, MethodTable, Responder, handler};
pub use context::{Context, ContextId, ContextTree, MessageEvent};
pub use discovery::{Discovery, DiscoveryOptions, Role};
pub use error::{BridgeError, ChannelError, DiscoveryError, TransportError};
