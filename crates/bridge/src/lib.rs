//! The bridge host: runs one supervised (endpoint, provider) pair per bridge.
//!
//! Each bridge holds a persistent outbound WebSocket to its endpoint and a
//! child provider process, tunneling newline-delimited JSON-RPC frames
//! between the two. The reconciler drives the set of running bridges toward
//! {enabled endpoints} × {enabled providers}.

pub mod error;
pub mod filter;
pub mod pipe;
pub mod reconcile;
pub mod supervisor;

pub use error::BridgeError;
pub use supervisor::BridgeContext;
