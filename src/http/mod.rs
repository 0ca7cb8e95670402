//! HTTP layer.
//!
//! - [`handler`]: Terraform module-registry routes, the dispatcher that binds
//!   them to the [`Repository`](crate::repository::Repository), and the
//!   error-to-response mapping.

pub mod handler;
