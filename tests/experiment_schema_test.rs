//! Experiment Schema Tests
//!
//! Definitions, validation and wire format of the A/B records.

use trueno_ab::experiment::{
    Aggregation, Event, Experiment, ExperimentSpec, ExperimentStatus, Metric, MetricType,
    ResultRecord, Variant,
};
use trueno_ab::Error;

fn two_arm(weights: (f64, f64)) -> ExperimentSpec {
    ExperimentSpec::builder("Homepage hero")
        .description("hero image test")
        .variant(Variant::new("control", weights.0))
        .variant(Variant::new("treatment", weights.1).with_description("new hero"))
        .metric(Metric::new("ctr", MetricType::Rate).primary())
        .build()
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_valid_spec() {
    assert!(two_arm((0.5, 0.5)).validate(0.01).is_ok());
    // Within tolerance
    assert!(two_arm((0.5, 0.505)).validate(0.01).is_ok());
}

#[test]
fn test_weights_must_sum_to_one() {
    let err = two_arm((0.5, 0.3)).validate(0.01).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(format!("{err}").contains("sum to 0.8000"));
}

#[test]
fn test_requires_two_variants_and_a_metric() {
    let one_variant = ExperimentSpec::builder("x")
        .variant(Variant::new("only", 1.0))
        .metric(Metric::new("m", MetricType::Binary))
        .build();
    assert!(one_variant.validate(0.01).is_err());

    let no_metric = ExperimentSpec::builder("x")
        .variant(Variant::new("a", 0.5))
        .variant(Variant::new("b", 0.5))
        .build();
    assert!(no_metric.validate(0.01).is_err());
}

#[test]
fn test_duplicate_names_rejected() {
    let dup_variant = ExperimentSpec::builder("x")
        .variant(Variant::new("a", 0.5))
        .variant(Variant::new("a", 0.5))
        .metric(Metric::new("m", MetricType::Binary))
        .build();
    assert!(format!("{}", dup_variant.validate(0.01).unwrap_err()).contains("duplicate variant"));

    let dup_metric = ExperimentSpec::builder("x")
        .variant(Variant::new("a", 0.5))
        .variant(Variant::new("b", 0.5))
        .metric(Metric::new("m", MetricType::Binary))
        .metric(Metric::new("m", MetricType::Numerical))
        .build();
    assert!(format!("{}", dup_metric.validate(0.01).unwrap_err()).contains("duplicate metric"));
}

// =============================================================================
// Experiment
// =============================================================================

#[test]
fn test_experiment_from_spec() {
    let experiment = Experiment::from_spec(two_arm((0.5, 0.5)));

    assert_eq!(experiment.status(), ExperimentStatus::Draft);
    assert_eq!(experiment.name(), "Homepage hero");
    assert_eq!(experiment.created_by(), "system");
    assert_eq!(experiment.control_variant().unwrap().name, "control");
    assert_eq!(experiment.primary_metrics().count(), 1);
    assert!(experiment.variant("treatment").is_some());
    assert!(experiment.metric("ctr").is_some());
    assert!(experiment.end_date().is_none());
}

#[test]
fn test_experiment_ids_unique() {
    let a = Experiment::from_spec(two_arm((0.5, 0.5)));
    let b = Experiment::from_spec(two_arm((0.5, 0.5)));
    assert_ne!(a.id(), b.id());
}

#[test]
fn test_status_transitions() {
    use ExperimentStatus::{Cancelled, Completed, Draft, Paused, Running};

    assert!(Draft.can_transition_to(Running));
    assert!(Running.can_transition_to(Paused));
    assert!(Paused.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Paused.can_transition_to(Completed));
    assert!(Running.can_transition_to(Cancelled));

    assert!(!Draft.can_transition_to(Paused));
    assert!(!Draft.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Running));
    assert!(!Cancelled.can_transition_to(Running));
    assert!(!Running.can_transition_to(Running));

    assert!(Completed.is_terminal());
    assert!(!Paused.is_terminal());
}

// =============================================================================
// Wire format
// =============================================================================

#[test]
fn test_spec_from_json_uses_defaults() {
    let json = r#"{
        "name": "checkout",
        "variants": [
            {"name": "A", "weight": 0.5},
            {"name": "B", "weight": 0.5}
        ],
        "metrics": [
            {"name": "conversion", "type": "binary", "is_primary": true},
            {"name": "basket", "type": "numerical", "aggregation": "sum"}
        ]
    }"#;

    let spec: ExperimentSpec = serde_json::from_str(json).unwrap();
    assert!(spec.validate(0.01).is_ok());
    assert_eq!(spec.created_by, "system");
    assert!(spec.metrics[0].is_primary);
    assert_eq!(spec.metrics[1].aggregation, Aggregation::Sum);
    assert_eq!(spec.metrics[1].metric_type, MetricType::Numerical);
}

#[test]
fn test_status_serializes_lowercase() {
    let json = serde_json::to_string(&ExperimentStatus::Running).unwrap();
    assert_eq!(json, "\"running\"");
}

#[test]
fn test_event_defaults() {
    let event = Event::new("exp", "user", "A", "click");
    assert!((event.event_value() - 1.0).abs() < f64::EPSILON);
    assert!(event.event_data().as_object().unwrap().is_empty());

    let with_data = Event::builder("exp", "user", "A", "purchase")
        .value(19.99)
        .data(serde_json::json!({"sku": "X-1"}))
        .build();
    assert_eq!(with_data.event_data()["sku"], "X-1");
    assert_ne!(event.event_id(), with_data.event_id());
}

#[test]
fn test_result_record_serialization() {
    let row = ResultRecord::builder("exp", "A", "ctr", 0.12, 500)
        .variance(0.1056)
        .build();

    let json = serde_json::to_string(&row).unwrap();
    let back: ResultRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(row, back);
    assert!(back.p_value().is_none());
    assert!(!back.is_significant());
}
