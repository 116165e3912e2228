//! ClariPhish API - public tracking surface and admin REST API
//!
//! This crate provides the HTTP layer for ClariPhish: the unauthenticated
//! tracking endpoints hit by mail clients and browsers, the bearer-token
//! protected campaign API, and health and metrics endpoints.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
