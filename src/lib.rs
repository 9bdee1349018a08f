//! prm - remote connection catalog.
//!
//! Keeps an in-memory mirror of stored server profiles with a derived tag
//! index ([`registry::ServerRegistry`]), and a pool holding at most one live
//! session window per server ([`pool::SessionWindowPool`]).

pub mod config;
pub mod events;
pub mod pool;
pub mod preferences;
pub mod record;
pub mod registry;
pub mod store;
pub mod tags;
