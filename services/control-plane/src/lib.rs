//! pit control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod config;
pub mod gateway;
pub mod job;
pub mod planner;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod store;
