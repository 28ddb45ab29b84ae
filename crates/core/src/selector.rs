//! Selector construction (spec.md §4.4 "Selector construction").

use serde::{Deserialize, Serialize};

/// How the set of series to export is chosen (spec.md §3 ExportConfig.Selection).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Selection {
    /// Preset mode: filter by component/job labels.
    ComponentsJobs { components: Vec<String>, jobs: Vec<String> },
    /// Raw label selector string, with an optional per-job filter applied
    /// the same way as preset mode.
    Selector { expr: String, jobs: Vec<String> },
    /// MetricsQL expression, used verbatim with no job intersection.
    MetricsQL { expr: String },
}

/// Escape a label value for safe inclusion in a regex alternation
/// (`{job=~"a|b|c"}`). Never concatenate raw user values into a selector
/// (spec.md §9 "Regex safety in selectors"). Delegates to `regex::escape`
/// rather than hand-rolling metacharacter matching.
pub fn escape_regex_value(value: &str) -> String {
    regex::escape(value)
}

/// Build a job alternation filter fragment: `job=~"<escaped>|<escaped>"`.
/// Returns `None` when `jobs` is empty.
fn job_filter(jobs: &[String]) -> Option<String> {
    if jobs.is_empty() {
        return None;
    }
    let escaped: Vec<String> = jobs.iter().map(|j| escape_regex_value(j)).collect();
    Some(format!("job=~\"{}\"", escaped.join("|")))
}

/// Construct the series selector string for a `Selection` (spec.md §4.4).
pub fn build_selector(selection: &Selection) -> String {
    match selection {
        Selection::ComponentsJobs { jobs, .. } => match job_filter(jobs) {
            Some(filter) => format!("{{{filter}}}"),
            None => "{__name__!=\"\"}".to_string(),
        },
        Selection::Selector { expr, jobs } => match job_filter(jobs) {
            Some(filter) => {
                // Splice the job filter into the existing selector body.
                let body = expr.trim().trim_start_matches('{').trim_end_matches('}').trim();
                if body.is_empty() {
                    format!("{{{filter}}}")
                } else {
                    format!("{{{body},{filter}}}")
                }
            }
            None => expr.clone(),
        },
        Selection::MetricsQL { expr } => expr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_jobs_with_jobs_produces_alternation() {
        let sel = Selection::ComponentsJobs {
            components: vec!["vmstorage".into()],
            jobs: vec!["vmstorage-prod".into()],
        };
        assert_eq!(build_selector(&sel), r#"{job=~"vmstorage\-prod"}"#);
    }

    #[test]
    fn components_jobs_without_jobs_matches_everything() {
        let sel = Selection::ComponentsJobs { components: vec![], jobs: vec![] };
        assert_eq!(build_selector(&sel), r#"{__name__!=""}"#);
    }

    #[test]
    fn job_values_are_individually_escaped() {
        let sel = Selection::ComponentsJobs {
            components: vec![],
            jobs: vec!["a.b+c".into(), "d|e".into()],
        };
        let out = build_selector(&sel);
        assert_eq!(out, r#"{job=~"a\.b\+c|d\|e"}"#);
    }

    #[test]
    fn metricsql_passes_through_verbatim() {
        let sel = Selection::MetricsQL { expr: "rate(http_requests_total[5m])".into() };
        assert_eq!(build_selector(&sel), "rate(http_requests_total[5m])");
    }

    #[test]
    fn selector_mode_splices_job_filter_into_existing_body() {
        let sel = Selection::Selector {
            expr: r#"{instance="10.0.0.1:9100"}"#.into(),
            jobs: vec!["node-exporter".into()],
        };
        assert_eq!(
            build_selector(&sel),
            r#"{instance="10.0.0.1:9100",job=~"node\-exporter"}"#
        );
    }
}
