use crate::config::HealthConfig;
use crate::AmpError;
use std::collections::VecDeque;

/// Circuit breaker over recent transfer outcomes
///
/// Every `interval` completions the error share among the last `tail`
/// outcomes is compared to the threshold; reaching it is fatal. The counter
/// lives in the process, so a restarted worker starts with a clean slate.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: usize,
    tail: usize,
    threshold: i64,
    outcomes: VecDeque<bool>,
    completed: usize,
}

impl HealthMonitor {
    pub fn new(interval: usize, tail: usize, threshold: i64) -> Self {
        Self {
            interval: interval.max(1),
            tail: tail.max(1),
            threshold,
            outcomes: VecDeque::with_capacity(tail.max(1)),
            completed: 0,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.interval, config.effective_tail(), config.threshold)
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Records one completed transfer
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The process may continue
    /// * `Err(AmpError::HealthCheck)` - The error rate reached the threshold
    pub fn record(&mut self, failed: bool) -> Result<(), AmpError> {
        if !self.is_enabled() {
            return Ok(());
        }

        if self.outcomes.len() == self.tail {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(failed);
        self.completed += 1;

        if self.completed % self.interval != 0 {
            return Ok(());
        }

        let sampled = self.outcomes.len();
        let errors = self.outcomes.iter().filter(|&&failed| failed).count();
        tracing::debug!("Health check: {} errors in last {}", errors, sampled);

        if (errors as i64) * 100 >= self.threshold * sampled as i64 {
            return Err(AmpError::HealthCheck { errors, sampled });
        }
        Ok(())
    }
}
