//! # Trueno-AB: Embedded A/B Experiment Engine
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB creates experiments, assigns users to weighted variants,
//! aggregates outcome events into streaming counters, and periodically tests
//! the variants for statistically significant differences.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke safety**: Assignment uniqueness and status changes are
//!   enforced by the store (insert-if-absent, compare-and-set), not by callers
//! - **Muda elimination**: Counters are updated with server-side increments;
//!   no fetch-then-add round trips
//! - **Jidoka**: Scheduler failures stop the tick, not the engine; transient
//!   errors back off and retry
//! - **Genchi Genbutsu**: Variance comes from a retained sum of squares, so
//!   the tests see the data as it is
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use trueno_ab::config::EngineConfig;
//! use trueno_ab::experiment::{ExperimentSpec, Metric, MetricType, Variant};
//! use trueno_ab::lifecycle::ExperimentManager;
//! use trueno_ab::metric_store::MemoryMetricStore;
//! use trueno_ab::repository::MemoryRepository;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> trueno_ab::Result<()> {
//! let manager = ExperimentManager::new(
//!     Arc::new(MemoryRepository::new()),
//!     Arc::new(MemoryMetricStore::new()),
//!     EngineConfig::default(),
//! );
//!
//! let experiment = manager
//!     .create(
//!         ExperimentSpec::builder("Pricing page")
//!             .variant(Variant::new("control", 0.3))
//!             .variant(Variant::new("annual-first", 0.7))
//!             .metric(Metric::new("revenue", MetricType::Numerical).primary())
//!             .build(),
//!     )
//!     .await?;
//! manager.start(experiment.id()).await?;
//!
//! let first = manager.assign(experiment.id(), "user-1").await?;
//! let again = manager.assign(experiment.id(), "user-1").await?;
//! assert_eq!(first.variant_name, again.variant_name);
//! assert!(again.already_assigned);
//! # manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregation;
pub mod assignment;
pub mod config;
pub mod error;
pub mod experiment;
pub mod lifecycle;
pub mod logging;
pub mod metric_store;
pub mod repository;
pub mod scheduler;
pub mod stats;

pub use error::{Error, Result};
