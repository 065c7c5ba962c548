//! acmes server: certificate issuance over a mutually authenticated channel

pub mod api;
pub mod coalesce;
pub mod coordinator;
pub mod server;

pub use api::{build_router, AppState};
pub use coordinator::{Coordinator, CoordinatorError};
pub use server::{AcmesServer, ServerError};
