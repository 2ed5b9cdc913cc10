//! In-memory restoration state and its building blocks.

/// Collaborator services consulted by the coordinator.
pub mod context;
/// Restoration record and aggregation.
pub mod restoration;
/// Operation capability trait.
pub mod state;
/// Registry of all restorations owned by this leader.
pub mod store;
/// Per-tablet progress tracking.
pub mod tablets;
/// In-flight RPC throttling.
pub mod throttle;
