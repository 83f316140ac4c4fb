//! HTTP service surface
//!
//! One axum router serves both the meta service consumed by storage nodes
//! (heartbeat, DDL, routing) and the admin API. Non-leader nodes proxy
//! every endpoint except the purely local ones to the current leader.

mod http;
mod types;

pub use http::{router, ApiState};
pub use types::ApiResponse;
