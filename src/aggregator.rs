use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::matcher_pool::MatchOutcome;
use crate::recognition::PlannedProcess;

/// Vote of a comparison where no face was found
pub const NOT_DETECTED: f64 = -1.0;

/// In-flight votes of one (matcher, invocation) pair
#[derive(Debug, Clone)]
pub struct RecognitionProcess {
    pub client_id: i64,
    pub face_id: String,
    pub camera_id: i64,
    pub expected: usize,
    sum: f64,
    count: usize,
}

impl RecognitionProcess {
    fn record(&mut self, similarity: Option<f32>) {
        self.sum += similarity.map(f64::from).unwrap_or(NOT_DETECTED);
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            return NOT_DETECTED;
        }
        self.sum / self.count as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub client_id: i64,
    pub face_id: String,
    pub camera_id: i64,
    pub similarity: f32,
}

/// Averages comparison votes per correlation token. Arrival order does not
/// matter; a process is dropped as soon as all its votes are in.
pub struct RecognitionAggregator {
    threshold: f64,
    processes: HashMap<Uuid, RecognitionProcess>,
}

impl RecognitionAggregator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, processes: HashMap::new() }
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    pub fn register(&mut self, camera_id: i64, planned: &PlannedProcess) {
        if planned.expected == 0 {
            return;
        }
        self.processes.insert(planned.token, RecognitionProcess {
            client_id: planned.client_id,
            face_id: planned.face_id.clone(),
            camera_id,
            expected: planned.expected,
            sum: 0.0,
            count: 0,
        });
    }

    pub fn record(&mut self, outcome: &MatchOutcome) -> Option<Verdict> {
        let Some(process) = self.processes.get_mut(&outcome.token) else {
            debug!("Dropping result for unknown recognition {}", outcome.token);
            return None;
        };
        process.record(outcome.similarity);
        if process.count < process.expected {
            return None;
        }

        let process = self.processes.remove(&outcome.token)?;
        let mean = process.mean();
        debug!("Recognition {} for client {} averaged {:.3}", outcome.token, process.client_id, mean);
        if mean > self.threshold {
            info!("Camera {} recognized client {} ({:.3})", process.camera_id, process.client_id, mean);
            return Some(Verdict {
                client_id: process.client_id,
                face_id: process.face_id,
                camera_id: process.camera_id,
                similarity: mean as f32,
            });
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.processes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(expected: usize) -> PlannedProcess {
        PlannedProcess { token: Uuid::new_v4(), client_id: 11, face_id: "f".into(), expected }
    }

    fn outcome(token: Uuid, similarity: Option<f32>) -> MatchOutcome {
        MatchOutcome { token, client_id: 11, similarity }
    }

    #[test]
    fn test_not_detected_pulls_mean_below_threshold() {
        let mut aggregator = RecognitionAggregator::new(0.6);
        let process = planned(3);
        aggregator.register(2, &process);

        let mut tracked = RecognitionProcess {
            client_id: 11, face_id: "f".into(), camera_id: 2, expected: 3, sum: 0.0, count: 0,
        };
        for similarity in [Some(0.8), None, Some(0.75)] {
            tracked.record(similarity);
            assert!(aggregator.record(&outcome(process.token, similarity)).is_none());
        }
        assert!((tracked.mean() - 0.55 / 3.0).abs() < 1e-6);
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_order_does_not_matter() {
        let votes = [Some(0.9), Some(0.7), None, Some(0.95), Some(0.85)];
        let orders: [[usize; 5]; 3] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]];

        let mut verdicts = Vec::new();
        for order in orders {
            let mut aggregator = RecognitionAggregator::new(0.4);
            let process = planned(votes.len());
            aggregator.register(6, &process);
            let mut verdict = None;
            for i in order {
                verdict = aggregator.record(&outcome(process.token, votes[i]));
            }
            verdicts.push(verdict.unwrap());
        }
        for verdict in &verdicts {
            assert_eq!(verdict.client_id, 11);
            assert_eq!(verdict.camera_id, 6);
            assert!((verdict.similarity - 0.48).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_verdict_then_entry_removed() {
        let mut aggregator = RecognitionAggregator::new(0.5);
        let process = planned(2);
        aggregator.register(1, &process);

        assert!(aggregator.record(&outcome(process.token, Some(0.9))).is_none());
        let verdict = aggregator.record(&outcome(process.token, Some(0.8))).unwrap();
        assert!((verdict.similarity - 0.85).abs() < 1e-6);

        assert!(aggregator.record(&outcome(process.token, Some(0.9))).is_none());
        assert_eq!(aggregator.pending(), 0);
    }
}
