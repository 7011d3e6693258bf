//! A/B Experiment Schema
//!
//! Data structures shared by every engine component.
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< Variant (N, ordered; first = control)
//!      │       └───< Metric (N)
//!      ├──< Assignment (N) [unique per user]
//!      ├──< Event (N) [append-only]
//!      └──< ResultRecord (N) [append-only snapshots]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::experiment::{Experiment, ExperimentSpec, ExperimentStatus, Metric, MetricType, Variant};
//!
//! let spec = ExperimentSpec::builder("Checkout button colour")
//!     .variant(Variant::new("blue", 0.5))
//!     .variant(Variant::new("green", 0.5))
//!     .metric(Metric::new("conversion", MetricType::Binary).primary())
//!     .build();
//! spec.validate(0.01).unwrap();
//!
//! let experiment = Experiment::from_spec(spec);
//! assert_eq!(experiment.status(), ExperimentStatus::Draft);
//! assert_eq!(experiment.control_variant().unwrap().name, "blue");
//! ```

mod assignment_record;
mod event_record;
mod experiment_record;
mod result_record;
mod variant;

pub use assignment_record::Assignment;
pub use event_record::{Event, EventBuilder};
pub use experiment_record::{Experiment, ExperimentSpec, ExperimentSpecBuilder, ExperimentStatus};
pub use result_record::{
    ConfidenceInterval, ResultRecord, ResultRecordBuilder, Significance, SignificanceTest,
    SignificanceUpdate,
};
pub use variant::{Aggregation, ConfigMap, Metric, MetricType, Variant};
