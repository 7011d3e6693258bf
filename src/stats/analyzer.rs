//! Significance pass over the current result rows of an experiment.

use std::sync::Arc;

use tracing::debug;

use super::{compare_groups, confidence_interval, SampleSummary};
use crate::experiment::{Experiment, ResultRecord, Significance, SignificanceUpdate};
use crate::repository::{Repository, SignificanceWrite};
use crate::{Error, Result};

/// Outcome of the pass for one primary metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricAnalysis {
    /// Metric tested
    pub metric_name: String,
    /// Variants with at least one observation
    pub variants_tested: usize,
    /// `None` when the input was insufficient for a test
    pub significance: Option<Significance>,
}

/// Computes confidence intervals and significance for primary metrics and
/// writes them onto the latest materialized rows.
#[derive(Debug)]
pub struct SignificanceAnalyzer<R> {
    repository: Arc<R>,
    significance_level: f64,
    z_score: f64,
}

impl<R> Clone for SignificanceAnalyzer<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            significance_level: self.significance_level,
            z_score: self.z_score,
        }
    }
}

impl<R: Repository> SignificanceAnalyzer<R> {
    /// Create an analyzer. `z_score` sizes the confidence intervals.
    pub const fn new(repository: Arc<R>, significance_level: f64, z_score: f64) -> Self {
        Self {
            repository,
            significance_level,
            z_score,
        }
    }

    /// Analyze every primary, moment-based metric of `experiment`.
    ///
    /// Insufficient input is not an error: the metric's significance stays
    /// empty and the intervals are still written. Every write of the pass is
    /// sent as one batch.
    ///
    /// # Errors
    ///
    /// Returns repository errors unchanged.
    pub async fn analyze(&self, experiment: &Experiment) -> Result<Vec<MetricAnalysis>> {
        let current = self.repository.latest_results(experiment.id()).await?;
        let mut analyses = Vec::new();
        let mut writes = Vec::new();

        for metric in experiment
            .primary_metrics()
            .filter(|m| m.metric_type.is_moment_based())
        {
            // Declared variant order, observed variants only.
            let rows: Vec<&ResultRecord> = experiment
                .variants()
                .iter()
                .filter_map(|v| {
                    current.iter().find(|r| {
                        r.variant_name() == v.name
                            && r.metric_name() == metric.name
                            && r.sample_size() >= 1
                    })
                })
                .collect();
            let summaries: Vec<SampleSummary> =
                rows.iter().map(|r| SampleSummary::from_result(r)).collect();

            let significance = match compare_groups(&summaries) {
                Ok(outcome) => Some(Significance {
                    test: outcome.test,
                    statistic: outcome.statistic,
                    p_value: outcome.p_value,
                    significant: outcome.p_value < self.significance_level,
                }),
                Err(Error::StatisticalInput(reason)) => {
                    debug!(
                        experiment_id = experiment.id(),
                        metric = %metric.name,
                        %reason,
                        "Skipping significance test"
                    );
                    None
                }
                Err(e) => return Err(e),
            };

            for (row, summary) in rows.iter().zip(&summaries) {
                let update = SignificanceUpdate {
                    confidence_interval: Some(confidence_interval(summary, self.z_score)),
                    significance,
                };
                writes.push(SignificanceWrite::new(
                    row.variant_name(),
                    row.metric_name(),
                    update,
                ));
            }

            analyses.push(MetricAnalysis {
                metric_name: metric.name.clone(),
                variants_tested: rows.len(),
                significance,
            });
        }

        if !writes.is_empty() {
            self.repository
                .update_latest_significance(experiment.id(), writes)
                .await?;
        }
        Ok(analyses)
    }
}
