//! Authentication module for Dealflow billing
//!
//! Sessions are verified upstream; the gateway forwards the caller's identity in
//! request headers.

pub mod middleware;

pub use middleware::{AuthUser, Role, COMPANY_ID_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};
