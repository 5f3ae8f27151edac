//! Entry point of the discovery client.
//!
//! A [`Context`] owns the connector and cache reactor threads plus the persist
//! thread, and exposes the consumer and provider APIs on top of them. Build
//! one with [`Context::builder`].

mod builder;
#[allow(clippy::module_inception)]
mod context;

pub use builder::*;
pub use context::*;
