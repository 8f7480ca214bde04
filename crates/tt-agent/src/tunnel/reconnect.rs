//! Exponential backoff and the reconnect supervisor

use std::future::Future;
use std::time::Duration;

use tt_core::config::BackoffConfig;
use tt_core::traits::SessionClient;
use tt_core::SessionEnd;

/// Exponential backoff with jitter for reconnection attempts
pub struct ExponentialBackoff {
    /// First delay, restored by `reset`
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How the supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The listener told the agent to exit
    Exited,
    /// `max_retries` consecutive connection attempts failed
    GaveUp { attempts: u32 },
}

/// Keep a session with `target` alive.
///
/// Each attempt builds a fresh client from `factory`. Failed connects count
/// towards `max_retries` (0 means retry forever); a successful connect resets
/// both the count and the backoff. Every client is closed exactly once.
/// `sleep` is awaited between attempts.
pub async fn connect_with_retry<C, F, S, Fut>(
    target: &str,
    max_retries: u32,
    backoff: &BackoffConfig,
    mut factory: F,
    sleep: S,
) -> RetryOutcome
where
    C: SessionClient,
    F: FnMut() -> C,
    S: Fn(Duration) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut backoff = ExponentialBackoff::from_config(backoff);
    let mut attempts: u32 = 0;

    loop {
        let mut client = factory();

        if let Err(e) = client.connect().await {
            close_client(&mut client).await;
            attempts += 1;
            if max_retries != 0 && attempts >= max_retries {
                tracing::error!(
                    "Giving up on {} after {} failed attempts: {}",
                    target,
                    attempts,
                    e
                );
                return RetryOutcome::GaveUp { attempts };
            }
            let delay = backoff.next_delay();
            tracing::warn!(
                "Connection to {} failed (attempt {}): {}. Retrying in {:?}",
                target,
                attempts,
                e,
                delay
            );
            sleep(delay).await;
            continue;
        }

        tracing::info!("Connected to {}", target);
        backoff.reset();
        attempts = 0;

        let end = client.handle_commands().await;
        close_client(&mut client).await;
        match end {
            Ok(SessionEnd::Exit) => {
                tracing::info!("Listener at {} requested exit", target);
                return RetryOutcome::Exited;
            }
            Ok(SessionEnd::PeerClosed) => {
                tracing::info!("Listener at {} closed the connection", target);
            }
            Err(e) => {
                tracing::warn!("Session with {} ended: {}", target, e);
            }
        }

        let delay = backoff.next_delay();
        tracing::info!("Reconnecting to {} in {:?}", target, delay);
        sleep(delay).await;
    }
}

async fn close_client<C: SessionClient>(client: &mut C) {
    if let Err(e) = client.close().await {
        tracing::debug!("Error while closing client: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tt_core::error::{AuthError, SessionError};
    use tt_core::TetherError;

    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0, // No jitter for deterministic test
        );

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(2));
        assert_eq!(d3, Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0);

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert_eq!(d1, Duration::from_secs(30));
        assert_eq!(d2, Duration::from_secs(60)); // Capped at max
        assert_eq!(d3, Duration::from_secs(60)); // Still capped
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ExponentialBackoff::from_config(&BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 2.0, 0.5);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(10));
        assert!(delay <= Duration::from_secs(15));
    }

    #[derive(Clone, Copy)]
    enum Step {
        Fail,
        Session(SessionEnd),
        SessionError,
    }

    /// Scripted clients; each construction takes the next step, failing
    /// once the script runs out
    #[derive(Clone, Default)]
    struct Script {
        steps: Arc<Mutex<VecDeque<Step>>>,
        closes: Arc<Mutex<Vec<Arc<AtomicUsize>>>>,
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl Script {
        fn new(steps: &[Step]) -> Self {
            let script = Self::default();
            script.steps.lock().unwrap().extend(steps.iter().copied());
            script
        }

        fn client(&self) -> MockClient {
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            let closes = Arc::new(AtomicUsize::new(0));
            self.closes.lock().unwrap().push(Arc::clone(&closes));
            MockClient {
                step,
                connected: false,
                closes,
            }
        }

        fn constructed(&self) -> usize {
            self.closes.lock().unwrap().len()
        }

        fn all_closed_once(&self) -> bool {
            self.closes
                .lock()
                .unwrap()
                .iter()
                .all(|c| c.load(Ordering::SeqCst) == 1)
        }

        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }

        async fn run(&self, max_retries: u32) -> RetryOutcome {
            let sleeps = Arc::clone(&self.sleeps);
            connect_with_retry(
                "listener:9001",
                max_retries,
                &BackoffConfig::default(),
                || self.client(),
                move |delay| {
                    sleeps.lock().unwrap().push(delay);
                    std::future::ready(())
                },
            )
            .await
        }
    }

    struct MockClient {
        step: Step,
        connected: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionClient for MockClient {
        async fn connect(&mut self) -> Result<(), TetherError> {
            match self.step {
                Step::Fail => Err(AuthError::Rejected.into()),
                _ => {
                    self.connected = true;
                    Ok(())
                }
            }
        }

        async fn handle_commands(&mut self) -> Result<SessionEnd, TetherError> {
            match self.step {
                Step::Session(end) => Ok(end),
                _ => Err(SessionError::Closed("listener".into()).into()),
            }
        }

        async fn close(&mut self) -> Result<(), TetherError> {
            self.connected = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let script = Script::new(&[]);
        let outcome = script.run(3).await;

        assert_eq!(outcome, RetryOutcome::GaveUp { attempts: 3 });
        assert_eq!(script.constructed(), 3);
        assert!(script.all_closed_once());
        assert_eq!(
            script.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn test_zero_retries_is_unbounded() {
        let mut steps = vec![Step::Fail; 20];
        steps.push(Step::Session(SessionEnd::Exit));
        let script = Script::new(&steps);

        assert_eq!(script.run(0).await, RetryOutcome::Exited);
        assert_eq!(script.constructed(), 21);
        assert!(script.all_closed_once());
        // Capped at five minutes
        assert_eq!(script.sleeps().last(), Some(&Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_success_resets_attempts_and_backoff() {
        let script = Script::new(&[
            Step::Fail,
            Step::Session(SessionEnd::PeerClosed),
            Step::Fail,
            Step::Fail,
        ]);

        assert_eq!(script.run(2).await, RetryOutcome::GaveUp { attempts: 2 });
        assert_eq!(script.constructed(), 4);
        assert!(script.all_closed_once());
        assert_eq!(
            script.sleeps(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(5),
                Duration::from_secs(10)
            ]
        );
    }

    #[tokio::test]
    async fn test_session_error_reconnects() {
        let script = Script::new(&[Step::SessionError, Step::Session(SessionEnd::Exit)]);

        assert_eq!(script.run(1).await, RetryOutcome::Exited);
        assert_eq!(script.constructed(), 2);
        assert!(script.all_closed_once());
        assert_eq!(script.sleeps(), vec![Duration::from_secs(5)]);
    }
}
