//! HTTP surface: health and status endpoints

pub mod routes;

pub use routes::{create_router, AppState};
