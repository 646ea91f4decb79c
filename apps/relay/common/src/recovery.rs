use crate::ServiceError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RecoveryManager {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling from the
    /// base delay and capped at the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, ServiceError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, ServiceError>> + Send,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        return Err(ServiceError::RecoveryFailed {
                            attempts,
                            message: e.to_string(),
                        });
                    }

                    let delay = self.delay_for(attempts);
                    warn!(
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempts, self.max_attempts, e, delay
                    );

                    sleep(delay).await;
                }
            }
        }
    }
}
