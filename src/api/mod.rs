//! HTTP API surface

pub mod middleware;
pub mod server;
pub mod types;

pub use server::{AppState, HttpServer, ServerError};
pub use types::{HealthResponse, QueryRequest};
