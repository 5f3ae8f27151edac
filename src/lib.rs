//! Service discovery client runtime.
//!
//! Keeps a local, continuously refreshed copy of the service data published by
//! a discovery server: instance lists, route rules, rate-limit and
//! circuit-breaker rules. Consumers read snapshots without blocking on the
//! network; a single connector thread owns the discover stream and feeds the
//! [`LocalRegistry`].

mod cache;
mod config;
mod constants;
mod connector;
mod context;
mod errors;
pub mod metrics;
mod model;
pub mod proto;
pub mod reactor;
pub mod utils;

pub use cache::*;
pub use config::*;
pub use connector::*;
pub use context::*;
pub use errors::*;
pub use model::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
