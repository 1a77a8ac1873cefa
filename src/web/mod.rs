//! HTTP surface (Axum): sessions, submission, approvals and audit queries.

pub mod api;
pub mod router;
pub mod server;

pub use router::{create_app_router, AppState};
pub use server::{run_server, WebServerConfig};
