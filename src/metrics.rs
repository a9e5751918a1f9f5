//! Metrics collection for submission cycles
//!
//! Tracks asset sizes, latency and error history for each submit. Used for
//! diagnostics only; nothing here feeds back into the state machine.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Maximum number of completed cycles to retain in history
const MAX_CYCLE_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for one finished submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub submission_id: String,
    /// Unix timestamp when the submission started (seconds)
    pub started_at: u64,
    pub image_size_bytes: u64,
    pub audio_size_bytes: u64,
    pub platform: String,
    /// Request round trip in milliseconds
    pub latency_ms: u64,
    pub success: bool,
    /// Error kind (e.g. "server_error") if the cycle failed
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    /// Average latency (ms) across successful cycles
    pub avg_latency_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: u64,
    /// Category of error (e.g. "camera", "submission")
    pub error_type: String,
    pub message: String,
    pub submission_id: Option<String>,
}

struct CycleInProgress {
    submission_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    image_size: u64,
    audio_size: u64,
    platform: String,
}

impl CycleInProgress {
    fn to_metrics(&self, error: Option<(ErrorKind, String)>) -> CycleMetrics {
        CycleMetrics {
            submission_id: self.submission_id.to_string(),
            started_at: self.started_at_unix,
            image_size_bytes: self.image_size,
            audio_size_bytes: self.audio_size,
            platform: self.platform.clone(),
            latency_ms: self.started_at.elapsed().as_millis() as u64,
            success: error.is_none(),
            error_kind: error.as_ref().map(|(k, _)| k.as_str().to_string()),
            error_message: error.map(|(_, m)| m),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct MetricsCollector {
    /// Newest first
    history: VecDeque<CycleMetrics>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    current_cycle: Option<CycleInProgress>,
    total_cycles: u64,
    successful_cycles: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_CYCLE_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_cycle: None,
            total_cycles: 0,
            successful_cycles: 0,
        }
    }

    /// Start tracking a submission. A cycle still in progress was superseded
    /// and is not counted.
    pub fn start_cycle(
        &mut self,
        submission_id: Uuid,
        image_size: u64,
        audio_size: u64,
        platform: &str,
    ) {
        if let Some(old) = self.current_cycle.take() {
            log::debug!(
                "Metrics: cycle {} superseded by {}",
                old.submission_id,
                submission_id
            );
            self.total_cycles = self.total_cycles.saturating_sub(1);
        }

        self.current_cycle = Some(CycleInProgress {
            submission_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            image_size,
            audio_size,
            platform: platform.to_string(),
        });
        self.total_cycles += 1;
    }

    pub fn cycle_completed(&mut self, submission_id: Uuid) {
        let Some(cycle) = self.take_cycle(submission_id) else {
            return;
        };
        let metrics = cycle.to_metrics(None);
        log::info!(
            "Metrics: submission {} completed in {}ms (image {} bytes, audio {} bytes)",
            metrics.submission_id,
            metrics.latency_ms,
            metrics.image_size_bytes,
            metrics.audio_size_bytes
        );
        self.add_to_history(metrics);
        self.successful_cycles += 1;
    }

    pub fn cycle_failed(&mut self, submission_id: Uuid, kind: ErrorKind, message: String) {
        let Some(cycle) = self.take_cycle(submission_id) else {
            return;
        };
        let metrics = cycle.to_metrics(Some((kind, message.clone())));
        log::warn!(
            "Metrics: submission {} failed after {}ms - {}",
            metrics.submission_id,
            metrics.latency_ms,
            message
        );
        self.add_to_history(metrics);
        self.record_error(
            "submission".to_string(),
            message,
            Some(submission_id.to_string()),
        );
    }

    /// Aborted submissions are not counted.
    pub fn cycle_cancelled(&mut self, submission_id: Uuid) {
        if self.take_cycle(submission_id).is_some() {
            log::debug!("Metrics: submission {} cancelled", submission_id);
            self.total_cycles = self.total_cycles.saturating_sub(1);
        }
    }

    pub fn record_error(
        &mut self,
        error_type: String,
        message: String,
        submission_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            submission_id,
        };
        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|c| c.success).collect();
        let count = successful.len() as u64;
        let avg_latency_ms = if count > 0 {
            successful.iter().map(|c| c.latency_ms).sum::<u64>() / count
        } else {
            0
        };

        MetricsSummary {
            total_cycles: self.total_cycles,
            successful_cycles: self.successful_cycles,
            failed_cycles: self
                .total_cycles
                .saturating_sub(self.successful_cycles)
                .saturating_sub(self.current_cycle.is_some() as u64),
            avg_latency_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    pub fn get_history(&self) -> Vec<CycleMetrics> {
        self.history.iter().cloned().collect()
    }

    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_cycle(&self, submission_id: Uuid) -> bool {
        self.current_cycle
            .as_ref()
            .is_some_and(|c| c.submission_id == submission_id)
    }

    fn take_cycle(&mut self, submission_id: Uuid) -> Option<CycleInProgress> {
        if self.is_active_cycle(submission_id) {
            self.current_cycle.take()
        } else {
            None
        }
    }

    fn add_to_history(&mut self, metrics: CycleMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_CYCLE_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.get_summary();

        assert_eq!(summary.total_cycles, 0);
        assert_eq!(summary.successful_cycles, 0);
        assert_eq!(summary.failed_cycles, 0);
        assert!(collector.get_history().is_empty());
        assert!(collector.get_errors().is_empty());
    }

    #[test]
    fn test_successful_cycle_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_cycle(id, 2048, 1024, "instagram");
        std::thread::sleep(std::time::Duration::from_millis(10));
        collector.cycle_completed(id);

        let summary = collector.get_summary();
        assert_eq!(summary.total_cycles, 1);
        assert_eq!(summary.successful_cycles, 1);
        assert_eq!(summary.failed_cycles, 0);
        assert!(summary.avg_latency_ms >= 10);

        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].image_size_bytes, 2048);
        assert_eq!(history[0].audio_size_bytes, 1024);
    }

    #[test]
    fn test_failed_cycle_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_cycle(id, 1, 1, "facebook");
        collector.cycle_failed(id, ErrorKind::ServerError, "boom".to_string());

        let summary = collector.get_summary();
        assert_eq!(summary.failed_cycles, 1);
        assert_eq!(summary.last_error.unwrap().message, "boom");

        let history = collector.get_history();
        assert!(!history[0].success);
        assert_eq!(history[0].error_kind.as_deref(), Some("server_error"));
    }

    #[test]
    fn test_superseded_and_cancelled_cycles_not_counted() {
        let mut collector = MetricsCollector::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        collector.start_cycle(first, 1, 1, "instagram");
        collector.start_cycle(second, 1, 1, "instagram");
        // Late completion for the superseded cycle is ignored
        collector.cycle_completed(first);
        collector.cycle_cancelled(second);

        let summary = collector.get_summary();
        assert_eq!(summary.total_cycles, 0);
        assert!(collector.get_history().is_empty());
    }

    #[test]
    fn test_history_limit() {
        let mut collector = MetricsCollector::new();

        for i in 0..(MAX_CYCLE_HISTORY + 10) {
            let id = Uuid::new_v4();
            collector.start_cycle(id, i as u64, 0, "instagram");
            collector.cycle_completed(id);
        }

        let history = collector.get_history();
        assert_eq!(history.len(), MAX_CYCLE_HISTORY);
        assert!(history[0].image_size_bytes > history[MAX_CYCLE_HISTORY - 1].image_size_bytes);
    }
}
