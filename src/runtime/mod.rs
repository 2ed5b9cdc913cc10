//! Single-writer coordinator runtime and event stream APIs.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
/// RPC executor seam and completion tokens.
pub mod rpc;
