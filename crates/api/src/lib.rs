//! Admin HTTP API over the job host's queues.
//!
//! Exposes the router builder and its building blocks so the binary and the
//! integration tests share the same middleware stack.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod state;
