//! The account-selection and failure-handling core (spec §2).
//!
//! `model`, `eligibility`, `selection`, and `mutators` make up the pure
//! Balancer Logic (spec §4.5): no clock reads, no I/O, no shared state.
//! `facade` wraps that logic with the runtime state map, snapshot caching,
//! sticky routing and pinned accounts (spec §4.6). `usage_refresher` drives
//! the background-on-demand usage ingestion loop that feeds it (spec §4.4).

pub mod eligibility;
pub mod error;
pub mod facade;
pub mod model;
pub mod mutators;
pub mod selection;
pub mod usage_refresher;

pub use error::{Error, Result};
pub use facade::{Facade, FacadeConfig, SelectOutcome};
pub use model::{
    AccountState, RefusalReason, RuntimeState, SelectionResult, SelectionTrace, TierScore,
    TierWeights, UpstreamError,
};
pub use selection::select;
pub use usage_refresher::refresh_usage;
