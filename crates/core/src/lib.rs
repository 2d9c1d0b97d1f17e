//! Shared domain primitives for the job host.
//!
//! Kept free of runtime and broker dependencies so every other crate in the
//! workspace can depend on it.

pub mod error;
pub mod types;
