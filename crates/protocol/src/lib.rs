//! Lightly-parsed JSON-RPC 2.0 frames.
//!
//! The bridge and the hub move frames through mostly opaque: they parse just
//! enough to see `method`, `id`, and the presence of `result.tools`, and they
//! re-emit every field they did not touch. [`Frame`] keeps unknown fields in a
//! flattened map so a round-trip never loses data.

mod frame;

pub use frame::{Frame, FrameError};

/// Method names the core interprets. Everything else is forwarded verbatim.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// JSON-RPC error codes used by the hub.
pub mod error_codes {
    /// `tools/call` named a tool no connected provider owns.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// No provider socket is connected to receive a forwarded frame.
    pub const PROVIDER_UNAVAILABLE: i64 = -32000;
}

pub const JSONRPC_VERSION: &str = "2.0";
