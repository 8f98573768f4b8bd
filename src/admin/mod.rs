//! Management API
//!
//! An axum router over the [`Supervisor`](crate::proxy::Supervisor): create,
//! remove, list, start and stop proxies, feed them updates and stream their
//! events.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{AdminError, AdminResult, ErrorResponse};
pub use handlers::AdminState;
pub use server::{build_router, start_admin_server};
