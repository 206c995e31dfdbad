#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Dealflow API Library
//!
//! HTTP surface of the Dealflow billing engine: tenant billing endpoints and the
//! payment webhooks.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::{create_router, create_router_with_limit};
pub use state::AppState;
