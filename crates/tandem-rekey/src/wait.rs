//! Bounded waiting for a send key

use std::time::Duration;

use tandem_core::RatchetError;
use tokio::sync::watch;

use crate::error::RekeyError;

/// Call `getter` until it yields a key.
///
/// Tries once, then up to `attempts` more times with `delay` in between.
/// Returns the last error when attempts run out, or
/// [`RekeyError::Stopped`] as soon as `shutdown` turns true.
pub async fn wait_for_key<T, F>(
    mut getter: F,
    attempts: u32,
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<T, RekeyError>
where
    F: FnMut() -> Result<T, RatchetError>,
{
    let mut last = match getter() {
        Ok(key) => return Ok(key),
        Err(e) => e,
    };

    for attempt in 1..=attempts {
        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            () = stopped(shutdown) => return Err(RekeyError::Stopped),
        }

        match getter() {
            Ok(key) => return Ok(key),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "no send key yet");
                last = e;
            },
        }
    }

    Err(last.into())
}

/// Resolves once `shutdown` is true. Never resolves if the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let (_tx, mut rx) = watch::channel(false);

        let key = wait_for_key(|| Ok(7), 3, Duration::from_secs(60), &mut rx).await.unwrap();

        assert_eq!(key, 7);
    }

    #[tokio::test]
    async fn retries_until_key_appears() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);

        let key = wait_for_key(
            || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RatchetError::NoKeysAvailable)
                } else {
                    Ok("key")
                }
            },
            5,
            Duration::from_millis(1),
            &mut rx,
        )
        .await
        .unwrap();

        assert_eq!(key, "key");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = wait_for_key(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RatchetError::NoKeysAvailable)
            },
            2,
            Duration::from_millis(1),
            &mut rx,
        )
        .await;

        assert!(matches!(result, Err(RekeyError::Ratchet(RatchetError::NoKeysAvailable))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_aborts_wait() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result: Result<(), _> =
            wait_for_key(|| Err(RatchetError::NoKeysAvailable), 10, Duration::from_secs(60), &mut rx)
                .await;

        assert!(matches!(result, Err(RekeyError::Stopped)));
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_does_not_stop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);

        let result: Result<(), _> =
            wait_for_key(|| Err(RatchetError::NoKeysAvailable), 2, Duration::from_millis(1), &mut rx)
                .await;

        assert!(matches!(result, Err(RekeyError::Ratchet(_))));
    }
}
