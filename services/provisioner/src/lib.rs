//! Lornu AI Provisioner Library
//!
//! Dependency-ordered provisioning of the three-tier topology (network,
//! private DNS, managed database, secrets store, compute scale sets and the
//! L7 gateway).
//!
//! ## Pipeline
//!
//! - **Declaration**: JSON resource blocks with `${...}` expressions, parsed
//!   into a typed IR and checked against the per-kind [`schema`]
//! - **Graph**: references and `depends_on` become an explicit DAG, pruned of
//!   disabled conditional resources and checked for cycles
//! - **Reconcile**: recorded state is refreshed against the cloud and diffed
//!   into a [`plan::Plan`]
//! - **Schedule**: waves of ready nodes run concurrently, state is written back
//!   per node by a single writer task

pub mod config;
pub mod declaration;
pub mod engine;
pub mod error;
pub mod eval;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod reconcile;
pub mod report;
pub mod scheduler;
pub mod schema;
pub mod state;

pub use config::{AbortPolicy, EngineConfig};
pub use declaration::{Address, Declaration};
pub use engine::{Engine, EngineError, Prepared};
pub use error::ConfigError;
pub use report::{Outcome, RunReport};
