use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Expectation tag a caller may attach to a target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetTag {
    Expected,
    Common,
    #[default]
    Unspecified,
}

/// One port to probe, with optional label and tag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub port: u16,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tag: TargetTag,
}

impl Target {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            label: None,
            tag: TargetTag::Unspecified,
        }
    }

    pub fn labeled(port: u16, label: impl Into<String>, tag: TargetTag) -> Self {
        Self {
            port,
            label: Some(label.into()),
            tag,
        }
    }
}

/// Resolved category of a probed port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Expected,
    CommonService,
    Rogue,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Expected => "expected",
            Category::CommonService => "common-service",
            Category::Rogue => "rogue",
        }
    }
}

/// How a single connect attempt ended.
///
/// Only `Connected` counts as open. The other variants are all "closed" to callers that
/// look at the boolean alone; filtered and unreachable hosts typically show up as `TimedOut`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Connected,
    TimedOut,
    Refused,
    ResolutionFailed,
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_open(&self) -> bool {
        matches!(self, ProbeOutcome::Connected)
    }

    pub(crate) fn from_io_error(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeOutcome::Refused,
            std::io::ErrorKind::TimedOut => ProbeOutcome::TimedOut,
            _ => ProbeOutcome::Unreachable,
        }
    }
}

/// Outcome of testing one target against one host. Never mutated after it is recorded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub port: u16,
    pub open: bool,
    pub outcome: ProbeOutcome,
    pub label: Option<String>,
    pub category: Category,
    pub banner: Option<String>,
    pub latency_ms: u64,
    pub timestamp: String,
}

/// Per-category counts over a report.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub total_probed: usize,
    pub total_open: usize,
    pub expected: usize,
    pub common_service: usize,
    pub rogue: usize,
}

/// All results of one batch, keyed by port.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProbeReport {
    pub host: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub results: BTreeMap<u16, ProbeResult>,
}

impl ProbeReport {
    pub fn new(host: impl Into<String>, started_at: String) -> Self {
        Self {
            host: host.into(),
            started_at,
            finished_at: None,
            results: BTreeMap::new(),
        }
    }

    /// Insert a result. A port that already has a result keeps it; returns whether the
    /// result was stored.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        match self.results.entry(result.port) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(result);
                true
            }
        }
    }

    /// Fold another report's results into this one, first write wins.
    pub fn merge(&mut self, other: ProbeReport) {
        for (_, r) in other.results {
            self.record(r);
        }
        if other.finished_at.is_some() {
            self.finished_at = other.finished_at;
        }
    }

    pub fn get(&self, port: u16) -> Option<&ProbeResult> {
        self.results.get(&port)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn open(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.values().filter(|r| r.open)
    }

    pub fn closed(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.values().filter(|r| !r.open)
    }

    /// Open ports in the given category, ascending.
    pub fn open_in(&self, category: Category) -> Vec<&ProbeResult> {
        self.open().filter(|r| r.category == category).collect()
    }

    pub fn has_rogue(&self) -> bool {
        self.open().any(|r| r.category == Category::Rogue)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut s = ReportSummary {
            total_probed: self.results.len(),
            ..Default::default()
        };
        for r in self.open() {
            s.total_open += 1;
            match r.category {
                Category::Expected => s.expected += 1,
                Category::CommonService => s.common_service += 1,
                Category::Rogue => s.rogue += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(port: u16, open: bool, category: Category) -> ProbeResult {
        ProbeResult {
            port,
            open,
            outcome: if open {
                ProbeOutcome::Connected
            } else {
                ProbeOutcome::Refused
            },
            label: None,
            category,
            banner: None,
            latency_ms: 0,
            timestamp: "1970-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn record_keeps_first_result_per_port() {
        let mut report = ProbeReport::new("127.0.0.1", String::new());
        assert!(report.record(result(22, true, Category::Expected)));
        assert!(!report.record(result(22, false, Category::Rogue)));
        assert_eq!(report.len(), 1);
        assert!(report.get(22).unwrap().open);
    }

    #[test]
    fn summary_counts_open_ports_by_category() {
        let mut report = ProbeReport::new("h", String::new());
        report.record(result(22, true, Category::Expected));
        report.record(result(21, true, Category::CommonService));
        report.record(result(31337, true, Category::Rogue));
        report.record(result(6379, false, Category::Expected));
        let s = report.summary();
        assert_eq!(
            s,
            ReportSummary {
                total_probed: 4,
                total_open: 3,
                expected: 1,
                common_service: 1,
                rogue: 1,
            }
        );
        assert!(report.has_rogue());
    }

    #[test]
    fn closed_rogue_is_not_flagged() {
        let mut report = ProbeReport::new("h", String::new());
        report.record(result(31337, false, Category::Rogue));
        assert!(!report.has_rogue());
    }

    #[test]
    fn merge_adds_disjoint_chunks() {
        let mut a = ProbeReport::new("h", String::new());
        a.record(result(1, false, Category::Rogue));
        let mut b = ProbeReport::new("h", String::new());
        b.record(result(2, true, Category::Rogue));
        b.finished_at = Some("done".into());
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.finished_at.as_deref(), Some("done"));
    }

    #[test]
    fn outcome_maps_refused() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(ProbeOutcome::from_io_error(&err), ProbeOutcome::Refused);
        assert!(!ProbeOutcome::Refused.is_open());
        assert!(ProbeOutcome::Connected.is_open());
    }
}
