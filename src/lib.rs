//! Client-side synchronization engine for a periodic-clearing exchange.
//!
//! The exchange matches orders in discrete sessions, so client state only
//! changes at clearing boundaries. This crate keeps a local view of
//! balances, assets and settings aligned to those boundaries, reconciles
//! ledger deposits the exchange has not yet credited, follows Bitcoin
//! deposits and withdrawals through the minter, and validates orders
//! before they are sent.

pub mod auth;
pub mod bitcoin;
pub mod clients;
pub mod config;
pub mod deposit;
pub mod engine;
pub mod error;
pub mod events;
pub mod fixed_point;
pub mod models;
pub mod orders;
pub mod session;
pub mod store;
pub mod timer;
pub mod tls;

pub use engine::{EngineOptions, SyncEngine};
pub use error::{BatchSyncError, Result};
