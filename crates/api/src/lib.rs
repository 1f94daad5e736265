// API crate clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Lingkar API Library
//!
//! This crate contains the HTTP server components for the Lingkar platform:
//! routing, authentication, configuration and the billing route handlers.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
