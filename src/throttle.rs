// ABOUTME: Duty-cycle limiter bounding the fraction of wall time spent busy
// ABOUTME: Sleeps between chunks to converge on a configured utilization level

use std::time::{Duration, Instant};

/// Throttles a named operation to a duty cycle.
///
/// Wrap each unit of source-side work in `start()`/`end()` and call `wait()`
/// between units. The long-run fraction of wall time spent between paired
/// start/end calls converges to at most `level`; short-term overshoot is
/// bounded by the size of one chunk.
pub struct Throttle {
    name: &'static str,
    level: f64,
    start_time: Option<Instant>,
    job_start: Option<Instant>,
    busy: Duration,
}

impl Throttle {
    pub fn new(name: &'static str, percentage: f64) -> Self {
        let level = percentage.clamp(1.0, 100.0) / 100.0;
        tracing::debug!("Created new throttle {:?} at {}%", name, 100.0 * level);
        Throttle {
            name,
            level,
            start_time: None,
            job_start: None,
            busy: Duration::ZERO,
        }
    }

    /// Mark the start of a busy interval. The first call also pins the
    /// overall start used for wall-clock accounting.
    pub fn start(&mut self) {
        tracing::debug!("Starting {}", self.name);
        let now = Instant::now();
        self.job_start = Some(now);
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Mark the end of the current busy interval.
    pub fn end(&mut self) {
        tracing::debug!("Stopped {}", self.name);
        if let Some(job_start) = self.job_start.take() {
            self.busy += job_start.elapsed();
        }
    }

    /// Sleep long enough to pull utilization back under the configured level.
    /// The factor of two accelerates return to the target ratio.
    pub async fn wait(&self) {
        if self.level >= 1.0 {
            return;
        }
        let Some(start_time) = self.start_time else {
            return;
        };

        let wall_ms = start_time.elapsed().as_millis() as f64;
        let busy_ms = self.busy.as_millis() as f64;
        if wall_ms > 0.0 {
            tracing::debug!("Utilization {:.2}%", 100.0 * busy_ms / wall_ms);
        }

        let limit_ms = wall_ms * self.level;
        if busy_ms > limit_ms {
            let wait = Duration::from_millis((2.0 * (busy_ms - limit_ms)) as u64);
            tracing::debug!(
                "Waiting {:?} to keep utilization at {:.2}%",
                wait,
                self.level * 100.0
            );
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn level(&self) -> f64 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_clamping() {
        assert_eq!(Throttle::new("t", 80.0).level(), 0.8);
        assert_eq!(Throttle::new("t", 0.0).level(), 0.01);
        assert_eq!(Throttle::new("t", -5.0).level(), 0.01);
        assert_eq!(Throttle::new("t", 250.0).level(), 1.0);
    }

    #[tokio::test]
    async fn test_full_level_never_waits() {
        let mut throttle = Throttle::new("t", 100.0);
        throttle.start();
        throttle.end();
        // At level 1.0 wait() is a no-op, so this returns immediately.
        tokio::time::timeout(Duration::from_millis(50), throttle.wait())
            .await
            .expect("wait at 100% should not sleep");
    }

    #[tokio::test]
    async fn test_idle_throttle_does_not_wait() {
        let mut throttle = Throttle::new("t", 10.0);
        throttle.start();
        throttle.end();
        // With essentially zero busy time there is nothing to pay back.
        tokio::time::timeout(Duration::from_millis(50), throttle.wait())
            .await
            .expect("idle throttle should not sleep");
    }
}
