//! Summaries, conclusions and recommendations.
//!
//! Everything here is a pure function of records already read from the
//! repository.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::experiment::{Assignment, Event, Experiment, ExperimentStatus, ResultRecord};

/// A significant primary metric and its best variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Metric name
    pub metric: String,
    /// Best-performing variant
    pub variant: String,
    /// Control (first declared) variant
    pub control: String,
    /// `(best - control) / control * 100`, 0 when control is 0
    pub improvement: f64,
    /// p-value of the test
    pub p_value: f64,
}

impl Finding {
    /// Whether the control itself is the best variant.
    #[must_use]
    pub fn control_wins(&self) -> bool {
        self.variant == self.control
    }
}

/// Aggregate view of the current results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    /// Variants with at least one result row
    pub total_variants: usize,
    /// Metrics with at least one result row
    pub total_metrics: usize,
    /// Primary metric names, declared order
    pub primary_metrics: Vec<String>,
    /// One entry per significant primary metric
    pub significant_findings: Vec<Finding>,
    /// Sum of `sample_size` over every current row
    pub total_sample_size: u64,
}

/// Reply of the query boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Experiment id
    pub experiment_id: String,
    /// Experiment name
    pub experiment_name: String,
    /// Status at read time
    pub status: ExperimentStatus,
    /// Current row per (variant, metric)
    pub results: Vec<ResultRecord>,
    /// Summary
    pub summary: ExperimentSummary,
    /// Human-readable conclusions
    pub conclusions: Vec<String>,
}

/// Summarize current rows. Findings use the first declared variant as control.
#[must_use]
pub fn summarize(experiment: &Experiment, results: &[ResultRecord]) -> ExperimentSummary {
    let control = experiment
        .control_variant()
        .map(|v| v.name.as_str())
        .unwrap_or_default();

    let mut significant_findings = Vec::new();
    for metric in experiment.primary_metrics() {
        // Declared variant order so ties on value resolve to the earlier variant.
        let rows: Vec<&ResultRecord> = experiment
            .variants()
            .iter()
            .filter_map(|v| {
                results
                    .iter()
                    .find(|r| r.variant_name() == v.name && r.metric_name() == metric.name)
            })
            .collect();

        let Some(tested) = rows.iter().find(|r| r.is_significant()) else {
            continue;
        };
        let p_value = tested.p_value().unwrap_or(0.0);

        let best = rows.iter().copied().fold(None::<&ResultRecord>, |best, row| match best {
            Some(b) if b.value() >= row.value() => Some(b),
            _ => Some(row),
        });
        let Some(best) = best else { continue };

        let control_value = rows
            .iter()
            .find(|r| r.variant_name() == control)
            .map_or(0.0, |r| r.value());
        let improvement = if control_value == 0.0 {
            0.0
        } else {
            (best.value() - control_value) / control_value * 100.0
        };

        significant_findings.push(Finding {
            metric: metric.name.clone(),
            variant: best.variant_name().to_string(),
            control: control.to_string(),
            improvement,
            p_value,
        });
    }

    let mut variants: Vec<&str> = results.iter().map(ResultRecord::variant_name).collect();
    variants.sort_unstable();
    variants.dedup();
    let mut metrics: Vec<&str> = results.iter().map(ResultRecord::metric_name).collect();
    metrics.sort_unstable();
    metrics.dedup();

    ExperimentSummary {
        total_variants: variants.len(),
        total_metrics: metrics.len(),
        primary_metrics: experiment
            .primary_metrics()
            .map(|m| m.name.clone())
            .collect(),
        significant_findings,
        total_sample_size: results.iter().map(ResultRecord::sample_size).sum(),
    }
}

/// Conclusion sentences for a summary.
#[must_use]
pub fn conclusions(summary: &ExperimentSummary, min_total_sample_size: u64) -> Vec<String> {
    let mut out: Vec<String> = summary
        .significant_findings
        .iter()
        .map(|f| {
            if f.control_wins() {
                format!(
                    "Control variant {} performs significantly best in {}",
                    f.control, f.metric
                )
            } else {
                format!(
                    "Variant {} shows significant improvement ({:.1}%) in {} over control {}",
                    f.variant, f.improvement, f.metric, f.control
                )
            }
        })
        .collect();

    if out.is_empty() {
        out.push("No statistically significant differences found between variants".to_string());
    }
    if summary.total_sample_size < min_total_sample_size {
        out.push("Low sample size - results may not be statistically significant".to_string());
    }
    out
}

/// Assemble the query-boundary report.
#[must_use]
pub fn build_report(
    experiment: &Experiment,
    results: Vec<ResultRecord>,
    min_total_sample_size: u64,
) -> ExperimentReport {
    let summary = summarize(experiment, &results);
    let conclusions = conclusions(&summary, min_total_sample_size);
    ExperimentReport {
        experiment_id: experiment.id().to_string(),
        experiment_name: experiment.name().to_string(),
        status: experiment.status(),
        results,
        summary,
        conclusions,
    }
}

/// Assignment counts for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantAssignments {
    /// Variant name
    pub variant_name: String,
    /// Assignments
    pub total: u64,
    /// Assignments with `completed_at`
    pub completed: u64,
    /// Open assignments
    pub active: u64,
}

impl VariantAssignments {
    /// Tally assignments per declared variant, in declared order.
    #[must_use]
    pub fn tally(experiment: &Experiment, assignments: &[Assignment]) -> Vec<Self> {
        experiment
            .variants()
            .iter()
            .map(|v| {
                let (total, completed) = assignments
                    .iter()
                    .filter(|a| a.variant_name() == v.name)
                    .fold((0, 0), |(t, c), a| (t + 1, c + u64::from(!a.is_open())));
                Self {
                    variant_name: v.name.clone(),
                    total,
                    completed,
                    active: total - completed,
                }
            })
            .collect()
    }
}

/// Operational counters for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStats {
    /// Experiment id
    pub experiment_id: String,
    /// Assignments
    pub total_assignments: u64,
    /// Completed assignments
    pub completed_assignments: u64,
    /// Open assignments
    pub active_assignments: u64,
    /// `completed / total * 100`, 0 with no assignments
    pub completion_rate: f64,
    /// Events recorded
    pub total_events: u64,
    /// Event counts by name, most frequent first
    pub events_by_name: Vec<(String, u64)>,
    /// Assignments per variant
    pub variant_distribution: Vec<VariantAssignments>,
}

impl ExperimentStats {
    /// Compute stats from the experiment's assignment and event records.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_records(
        experiment: &Experiment,
        assignments: &[Assignment],
        events: &[Event],
    ) -> Self {
        let variant_distribution = VariantAssignments::tally(experiment, assignments);
        let total_assignments = assignments.len() as u64;
        let completed_assignments = assignments.iter().filter(|a| !a.is_open()).count() as u64;

        let mut by_name: BTreeMap<&str, u64> = BTreeMap::new();
        for event in events {
            *by_name.entry(event.event_name()).or_default() += 1;
        }
        let mut events_by_name: Vec<(String, u64)> = by_name
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        // Stable sort keeps name order among equal counts.
        events_by_name.sort_by(|a, b| b.1.cmp(&a.1));

        Self {
            experiment_id: experiment.id().to_string(),
            total_assignments,
            completed_assignments,
            active_assignments: total_assignments - completed_assignments,
            completion_rate: if total_assignments == 0 {
                0.0
            } else {
                completed_assignments as f64 / total_assignments as f64 * 100.0
            },
            total_events: events.len() as u64,
            events_by_name,
            variant_distribution,
        }
    }
}

/// Kind of timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    /// Experiment created
    Created,
    /// Experiment left `draft`
    Started,
    /// End date passed or the experiment finished
    Ended,
    /// Latest status change
    StatusChange,
}

/// One dated entry in an experiment's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Entry kind
    #[serde(rename = "type")]
    pub kind: TimelineEventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Human-readable description
    pub description: String,
}

/// Lifecycle history of one experiment, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTimeline {
    /// Experiment id
    pub experiment_id: String,
    /// Experiment name
    pub experiment_name: String,
    /// Entries sorted by timestamp
    pub timeline: Vec<TimelineEntry>,
}

impl ExperimentTimeline {
    /// Reconstruct the history from the experiment's own timestamps.
    ///
    /// Only the latest status change is known; earlier ones are not kept.
    #[must_use]
    pub fn from_experiment(experiment: &Experiment, now: DateTime<Utc>) -> Self {
        let status = experiment.status();
        let mut timeline = vec![TimelineEntry {
            kind: TimelineEventKind::Created,
            timestamp: experiment.created_at(),
            description: format!("Experiment '{}' created", experiment.name()),
        }];

        if status != ExperimentStatus::Draft {
            timeline.push(TimelineEntry {
                kind: TimelineEventKind::Started,
                timestamp: experiment.start_date(),
                description: "Experiment started".to_string(),
            });
            timeline.push(TimelineEntry {
                kind: TimelineEventKind::StatusChange,
                timestamp: experiment.updated_at(),
                description: format!("Status changed to {status}"),
            });
        }

        // A future end date is a plan, not history.
        if let Some(end) = experiment.end_date().filter(|end| *end <= now) {
            timeline.push(TimelineEntry {
                kind: TimelineEventKind::Ended,
                timestamp: end,
                description: "Experiment ended".to_string(),
            });
        }

        timeline.sort_by_key(|entry| entry.timestamp);
        Self {
            experiment_id: experiment.id().to_string(),
            experiment_name: experiment.name().to_string(),
            timeline,
        }
    }
}

/// Recommendation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// A variant significantly beats the rest
    SignificantImprovement,
    /// Too few observations
    SampleSize,
    /// Too few users reach the completion event
    CompletionRate,
    /// Metric values vary widely across variants
    MetricInconsistency,
}

/// Recommendation urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Act on it
    High,
    /// Worth a look
    Medium,
    /// Informational
    Low,
}

/// One actionable recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Category
    pub kind: RecommendationKind,
    /// Urgency
    pub priority: Priority,
    /// Human-readable advice
    pub message: String,
}

impl Recommendation {
    fn new(kind: RecommendationKind, priority: Priority, message: String) -> Self {
        Self {
            kind,
            priority,
            message,
        }
    }
}

/// Recommendations derived from a report and its stats.
#[must_use]
pub fn recommendations(
    report: &ExperimentReport,
    stats: &ExperimentStats,
    config: &EngineConfig,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for finding in &report.summary.significant_findings {
        let message = if finding.control_wins() {
            format!(
                "Keep control variant {}: no alternative beats it in {}",
                finding.control, finding.metric
            )
        } else {
            format!(
                "Consider implementing variant {} as it shows significant improvement in {}",
                finding.variant, finding.metric
            )
        };
        out.push(Recommendation::new(
            RecommendationKind::SignificantImprovement,
            Priority::High,
            message,
        ));
    }

    if report.summary.total_sample_size < config.min_total_sample_size() {
        out.push(Recommendation::new(
            RecommendationKind::SampleSize,
            Priority::Medium,
            "Sample size is low - consider running the experiment longer or increasing traffic"
                .to_string(),
        ));
    }

    if stats.total_assignments > 0 && stats.completion_rate < config.min_completion_rate() {
        out.push(Recommendation::new(
            RecommendationKind::CompletionRate,
            Priority::Medium,
            format!(
                "Completion rate is low ({:.1}%) - consider improving user engagement",
                stats.completion_rate
            ),
        ));
    }

    let noisy = inconsistent_metrics(&report.results, config.max_coefficient_of_variation());
    if !noisy.is_empty() {
        out.push(Recommendation::new(
            RecommendationKind::MetricInconsistency,
            Priority::Low,
            format!(
                "Metrics {} show high variation between variants - investigate potential confounding factors",
                noisy.join(", ")
            ),
        ));
    }

    out
}

/// Metrics whose cross-variant coefficient of variation exceeds `max_cv`.
#[allow(clippy::cast_precision_loss)]
fn inconsistent_metrics(results: &[ResultRecord], max_cv: f64) -> Vec<String> {
    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for row in results {
        values.entry(row.metric_name()).or_default().push(row.value());
    }

    values
        .into_iter()
        .filter(|(_, vs)| vs.len() >= 2)
        .filter(|(_, vs)| {
            let n = vs.len() as f64;
            let mean = vs.iter().sum::<f64>() / n;
            if mean == 0.0 {
                return false;
            }
            let std = (vs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            std / mean.abs() > max_cv
        })
        .map(|(name, _)| name.to_string())
        .collect()
}
