use serde::{Deserialize, Serialize};

/// Counters for watcher reconciliation passes
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScanMetrics {
    pub passes_total: u64,
    pub passes_succeeded: u64,
    pub passes_failed: u64,
    pub last_pass_ms: u64,
    pub projects_tracked: usize,
    pub conflicts_total: u64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pass that reconciled and persisted the registry
    pub fn record_success(&mut self, duration_ms: u64, projects_tracked: usize, conflicts: usize) {
        self.passes_total += 1;
        self.passes_succeeded += 1;
        self.last_pass_ms = duration_ms;
        self.projects_tracked = projects_tracked;
        self.conflicts_total += conflicts as u64;
    }

    /// Record a pass whose registry write failed
    pub fn record_failure(&mut self, duration_ms: u64) {
        self.passes_total += 1;
        self.passes_failed += 1;
        self.last_pass_ms = duration_ms;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.passes_total == 0 {
            return 100.0;
        }
        (self.passes_succeeded as f64 / self.passes_total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = ScanMetrics::new();
        assert_eq!(metrics.passes_total, 0);
        assert_eq!(metrics.passes_succeeded, 0);
        assert_eq!(metrics.passes_failed, 0);
        assert_eq!(metrics.projects_tracked, 0);
    }

    #[test]
    fn test_record_success() {
        let mut metrics = ScanMetrics::new();
        metrics.record_success(12, 4, 1);
        assert_eq!(metrics.passes_total, 1);
        assert_eq!(metrics.passes_succeeded, 1);
        assert_eq!(metrics.last_pass_ms, 12);
        assert_eq!(metrics.projects_tracked, 4);
        assert_eq!(metrics.conflicts_total, 1);

        metrics.record_success(8, 5, 0);
        assert_eq!(metrics.passes_total, 2);
        assert_eq!(metrics.projects_tracked, 5);
        assert_eq!(metrics.conflicts_total, 1);
    }

    #[test]
    fn test_record_failure_keeps_tracked_count() {
        let mut metrics = ScanMetrics::new();
        metrics.record_success(5, 3, 0);
        metrics.record_failure(40);
        assert_eq!(metrics.passes_failed, 1);
        assert_eq!(metrics.last_pass_ms, 40);
        assert_eq!(metrics.projects_tracked, 3);
    }

    #[test]
    fn test_success_rate_zero_passes() {
        assert_eq!(ScanMetrics::new().success_rate(), 100.0);
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut metrics = ScanMetrics::new();
        metrics.record_success(1, 1, 0);
        metrics.record_success(1, 1, 0);
        metrics.record_failure(1);
        metrics.record_success(1, 1, 0);
        // 3 of 4 = 75%
        assert_eq!(metrics.success_rate(), 75.0);
    }

    #[test]
    fn test_metrics_serialization() {
        let mut metrics = ScanMetrics::new();
        metrics.record_success(10, 2, 0);
        metrics.record_failure(20);

        let json = serde_json::to_string(&metrics).unwrap();
        let deserialized: ScanMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, metrics);
    }
}
