//! grps-server library crate.
//!
//! Exposes the HTTP router, the gRPC service and the shared serving state so
//! the API surface can be exercised in tests without binding sockets.

pub mod api;
pub mod logging;
pub mod rpc;
pub mod state;

pub use state::AppState;
