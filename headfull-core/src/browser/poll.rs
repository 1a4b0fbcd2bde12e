use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Deadline and spacing for a polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Runs `probe` until it yields a value or the deadline passes. The first
/// probe runs immediately, later ones once per interval. `None` means the
/// deadline passed without a hit.
pub async fn poll_until<T, F, Fut>(options: PollOptions, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + options.timeout;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(options.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn resolves_once_probe_succeeds() {
        let attempts = AtomicUsize::new(0);
        let options = PollOptions {
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(10),
        };
        let value = poll_until(options, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= 2 {
                Some(attempt)
            } else {
                None
            }
        })
        .await;
        assert_eq!(value, Some(2));
    }

    #[tokio::test]
    async fn gives_up_at_the_deadline() {
        let options = PollOptions {
            timeout: Duration::from_millis(50),
            interval: Duration::from_millis(10),
        };
        let value: Option<()> = poll_until(options, || async { None }).await;
        assert_eq!(value, None);
    }
}
