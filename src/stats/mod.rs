//! Statistical Analysis Engine
//!
//! Hypothesis tests over per-variant summaries (mean, variance, n) taken from
//! materialized result rows:
//!
//! - two groups: Welch's unequal-variance t-test, two-tailed
//! - three or more groups: one-way ANOVA, upper-tail F
//!
//! Distribution CDFs come from `statrs`.
//!
//! ```rust
//! use trueno_ab::stats::{welch_t_test, SampleSummary};
//!
//! let a = SampleSummary::new(10.0, 4.0, 500);
//! let b = SampleSummary::new(10.0, 4.0, 500);
//! let outcome = welch_t_test(&a, &b).unwrap();
//! assert!(outcome.p_value > 0.99);
//! ```

mod analyzer;
mod report;

pub use analyzer::{MetricAnalysis, SignificanceAnalyzer};
pub use report::{
    build_report, conclusions, recommendations, summarize, ExperimentReport, ExperimentStats,
    ExperimentSummary, ExperimentTimeline, Finding, Priority, Recommendation, RecommendationKind,
    TimelineEntry, TimelineEventKind, VariantAssignments,
};

use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};

use crate::experiment::{ConfidenceInterval, ResultRecord, SignificanceTest};
use crate::{Error, Result};

/// Mean, variance and size of one group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSummary {
    /// Group mean
    pub mean: f64,
    /// Group variance (`sum_of_squares/n - mean²`)
    pub variance: f64,
    /// Observations
    pub n: u64,
}

impl SampleSummary {
    /// Create a summary. Negative variance is clamped to 0.
    #[must_use]
    pub fn new(mean: f64, variance: f64, n: u64) -> Self {
        Self {
            mean,
            variance: variance.max(0.0),
            n,
        }
    }

    /// Summary of a materialized moment-metric row.
    #[must_use]
    pub fn from_result(row: &ResultRecord) -> Self {
        Self::new(row.value(), row.variance().unwrap_or(0.0), row.sample_size())
    }

    /// `sqrt(variance / n)`; 0 for an empty group.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn standard_error(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.variance / self.n as f64).sqrt()
        }
    }
}

/// Statistic and p-value of a completed test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOutcome {
    /// Test and degrees of freedom
    pub test: SignificanceTest,
    /// t or F
    pub statistic: f64,
    /// p-value in [0, 1]
    pub p_value: f64,
}

/// Welch's two-sample t-test.
///
/// # Errors
///
/// Returns `StatisticalInput` if either group has fewer than 2 observations.
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(a: &SampleSummary, b: &SampleSummary) -> Result<TestOutcome> {
    if a.n < 2 || b.n < 2 {
        return Err(Error::StatisticalInput(format!(
            "welch t-test needs n >= 2 per group (got {} and {})",
            a.n, b.n
        )));
    }

    let (n1, n2) = (a.n as f64, b.n as f64);
    let q1 = a.variance / n1;
    let q2 = b.variance / n2;
    let se = (q1 + q2).sqrt();
    let diff = a.mean - b.mean;

    if se == 0.0 {
        // Both groups are constant: identical means are indistinguishable,
        // different means are certain.
        let (statistic, p_value) = if diff == 0.0 {
            (0.0, 1.0)
        } else {
            (diff.signum() * f64::INFINITY, 0.0)
        };
        return Ok(TestOutcome {
            test: SignificanceTest::WelchT {
                degrees_of_freedom: n1 + n2 - 2.0,
            },
            statistic,
            p_value,
        });
    }

    let t = diff / se;
    let df = (q1 + q2).powi(2) / (q1.powi(2) / (n1 - 1.0) + q2.powi(2) / (n2 - 1.0));

    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| Error::StatisticalInput(format!("student's t (df={df}): {e}")))?;
    let p_value = (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0);

    Ok(TestOutcome {
        test: SignificanceTest::WelchT {
            degrees_of_freedom: df,
        },
        statistic: t,
        p_value,
    })
}

/// One-way ANOVA over two or more groups.
///
/// # Errors
///
/// Returns `StatisticalInput` with fewer than 2 groups, an empty group, or
/// `N - k < 1`.
#[allow(clippy::cast_precision_loss)]
pub fn one_way_anova(groups: &[SampleSummary]) -> Result<TestOutcome> {
    let k = groups.len();
    if k < 2 {
        return Err(Error::StatisticalInput(format!(
            "anova needs at least 2 groups (got {k})"
        )));
    }
    if groups.iter().any(|g| g.n == 0) {
        return Err(Error::StatisticalInput("anova group with no observations".into()));
    }

    let total: u64 = groups.iter().map(|g| g.n).sum();
    let df_between = (k - 1) as f64;
    let df_within = total as f64 - k as f64;
    if df_within < 1.0 {
        return Err(Error::StatisticalInput(format!(
            "anova needs N - k >= 1 (N={total}, k={k})"
        )));
    }

    let grand_mean = groups.iter().map(|g| g.n as f64 * g.mean).sum::<f64>() / total as f64;
    let ss_between: f64 = groups
        .iter()
        .map(|g| g.n as f64 * (g.mean - grand_mean).powi(2))
        .sum();
    let ss_within: f64 = groups
        .iter()
        .map(|g| (g.n as f64 - 1.0) * g.variance)
        .sum();

    let ms_between = ss_between / df_between;
    let ms_within = ss_within / df_within;
    let test = SignificanceTest::Anova {
        df_between,
        df_within,
    };

    if ms_within == 0.0 {
        let (statistic, p_value) = if ms_between == 0.0 {
            (0.0, 1.0)
        } else {
            (f64::INFINITY, 0.0)
        };
        return Ok(TestOutcome {
            test,
            statistic,
            p_value,
        });
    }

    let f = ms_between / ms_within;
    let dist = FisherSnedecor::new(df_between, df_within)
        .map_err(|e| Error::StatisticalInput(format!("F({df_between}, {df_within}): {e}")))?;
    let p_value = (1.0 - dist.cdf(f)).clamp(0.0, 1.0);

    Ok(TestOutcome {
        test,
        statistic: f,
        p_value,
    })
}

/// Pick the test by group count: Welch for two, ANOVA for more.
///
/// # Errors
///
/// Propagates the chosen test's `StatisticalInput`.
pub fn compare_groups(groups: &[SampleSummary]) -> Result<TestOutcome> {
    match groups {
        [a, b] => welch_t_test(a, b),
        _ => one_way_anova(groups),
    }
}

/// `mean ± z · sqrt(variance / n)`.
#[must_use]
pub fn confidence_interval(summary: &SampleSummary, z: f64) -> ConfidenceInterval {
    let margin = z * summary.standard_error();
    ConfidenceInterval {
        lower: summary.mean - margin,
        upper: summary.mean + margin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welch_identical_groups() {
        let a = SampleSummary::new(0.5, 0.25, 1000);
        let outcome = welch_t_test(&a, &a).unwrap();
        assert_eq!(outcome.statistic, 0.0);
        assert!((outcome.p_value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_welch_known_value() {
        // t = (0.6 - 0.3) / sqrt(0.24/100 + 0.21/100) = 4.4721, df ~= 197.1
        let a = SampleSummary::new(0.6, 0.24, 100);
        let b = SampleSummary::new(0.3, 0.21, 100);
        let outcome = welch_t_test(&a, &b).unwrap();

        assert!((outcome.statistic - 4.472_136).abs() < 1e-4);
        match outcome.test {
            SignificanceTest::WelchT { degrees_of_freedom } => {
                assert!((degrees_of_freedom - 197.1).abs() < 0.5);
            }
            SignificanceTest::Anova { .. } => panic!("expected welch"),
        }
        assert!(outcome.p_value < 1e-4);
    }

    #[test]
    fn test_welch_moderate_difference() {
        // t = 1.0 / sqrt(4/50 + 4/50) = 2.5, df = 98 -> p ~= 0.014
        let a = SampleSummary::new(11.0, 4.0, 50);
        let b = SampleSummary::new(10.0, 4.0, 50);
        let outcome = welch_t_test(&a, &b).unwrap();
        assert!((outcome.statistic - 2.5).abs() < 1e-9);
        assert!((outcome.p_value - 0.014).abs() < 0.002);
    }

    #[test]
    fn test_welch_needs_two_per_group() {
        let a = SampleSummary::new(1.0, 0.0, 1);
        let b = SampleSummary::new(2.0, 1.0, 10);
        assert!(matches!(
            welch_t_test(&a, &b),
            Err(Error::StatisticalInput(_))
        ));
    }

    #[test]
    fn test_welch_zero_variance() {
        let a = SampleSummary::new(1.0, 0.0, 10);
        let b = SampleSummary::new(1.0, 0.0, 10);
        assert_eq!(welch_t_test(&a, &b).unwrap().p_value, 1.0);

        let c = SampleSummary::new(0.0, 0.0, 10);
        assert_eq!(welch_t_test(&a, &c).unwrap().p_value, 0.0);
    }

    #[test]
    fn test_anova_equal_means() {
        let g = SampleSummary::new(5.0, 1.0, 30);
        let outcome = one_way_anova(&[g, g, g]).unwrap();
        assert_eq!(outcome.statistic, 0.0);
        assert!((outcome.p_value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_anova_known_value() {
        // grand mean 2, SSb = 10*(1+0+1) = 20, SSw = 3*9*1 = 27
        // F = (20/2) / (27/27) = 10 with (2, 27) df -> p ~= 0.00056
        let groups = [
            SampleSummary::new(1.0, 1.0, 10),
            SampleSummary::new(2.0, 1.0, 10),
            SampleSummary::new(3.0, 1.0, 10),
        ];
        let outcome = one_way_anova(&groups).unwrap();
        assert!((outcome.statistic - 10.0).abs() < 1e-9);
        assert!(outcome.p_value < 0.001);
        assert_eq!(
            outcome.test,
            SignificanceTest::Anova {
                df_between: 2.0,
                df_within: 27.0
            }
        );
    }

    #[test]
    fn test_anova_needs_within_df() {
        let g = SampleSummary::new(1.0, 0.0, 1);
        assert!(one_way_anova(&[g, g, g]).is_err());
        assert!(one_way_anova(&[g]).is_err());
    }

    #[test]
    fn test_compare_groups_dispatch() {
        let g = SampleSummary::new(1.0, 1.0, 10);
        assert!(matches!(
            compare_groups(&[g, g]).unwrap().test,
            SignificanceTest::WelchT { .. }
        ));
        assert!(matches!(
            compare_groups(&[g, g, g]).unwrap().test,
            SignificanceTest::Anova { .. }
        ));
    }

    #[test]
    fn test_confidence_interval() {
        let s = SampleSummary::new(3.0, 2.0, 5);
        let ci = confidence_interval(&s, 1.96);
        let margin = 1.96 * (2.0_f64 / 5.0).sqrt();
        assert!((ci.lower - (3.0 - margin)).abs() < 1e-12);
        assert!((ci.upper - (3.0 + margin)).abs() < 1e-12);

        let empty = confidence_interval(&SampleSummary::new(0.0, 0.0, 0), 1.96);
        assert_eq!(empty.lower, empty.upper);
    }
}
