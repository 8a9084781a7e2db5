//! # evoagent
//!
//! An agent that evolves its own capabilities: candidate tools and reasoning
//! principles are proposed, tested in an isolated sandbox, and committed to a
//! versioned, rollback-capable store only when they pass.
//!
//! Pipeline layout (leaves first):
//!
//! - [`sandbox`]: isolated execution of a candidate against a test harness
//! - [`store`]: content-addressed capability stores (tools, principles)
//! - [`ledger`] + [`tracker`]: append-only generation history and rollback
//! - [`integrator`]: propose -> test -> commit, one transaction per commit
//! - [`self_modify`]: benchmark-gated replacement of live components
//! - [`reflection`]: the two-attempt cycle that learns principles
//! - [`oracle`]: proposer, agent, judge and feature-extraction seams
//! - [`runtime`]: wiring from [`config::EvoConfig`]

pub mod artifact;
pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod integrator;
pub mod ledger;
pub mod oracle;
pub mod reflection;
pub mod runtime;
pub mod sandbox;
pub mod self_modify;
pub mod store;
pub mod tasks;
pub mod tracker;

pub use error::EvoError;
