//! Task helpers: the startup latch, a crash-tolerant loop driver and
//! latch-gated spawning.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// One-shot gate: closed until [`StartLatch::open`] is called, then open
/// forever.
#[derive(Debug, Clone)]
pub struct StartLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl StartLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the latch. Returns false if it was already open.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for StartLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn `fut` once `latch` opens.
pub fn on<F>(latch: &StartLatch, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let latch = latch.clone();
    tokio::spawn(async move {
        latch.wait().await;
        fut.await;
    })
}

/// Call `f` over and over until shutdown is signaled.
///
/// A panicking iteration is logged and followed by `recovery_delay` before
/// the next call. Shutdown interrupts an iteration in progress.
pub async fn until<F, Fut>(mut f: F, recovery_delay: Duration, mut shutdown: watch::Receiver<bool>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = AssertUnwindSafe(f()).catch_unwind() => {
                if let Err(panic) = result {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        delay_ms = recovery_delay.as_millis() as u64,
                        "Loop iteration panicked, resuming after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(recovery_delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
    debug!("Loop stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_latch_opens_once() {
        let latch = StartLatch::new();
        assert!(!latch.is_open());

        let early = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        assert!(latch.open());
        assert!(!latch.open());
        assert!(latch.is_open());

        early.await.unwrap();
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_on_waits_for_latch() {
        let latch = StartLatch::new();
        let ran = Arc::new(AtomicU32::new(0));

        let handle = on(&latch, {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        latch.open();
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_survives_panics() {
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let handle = tokio::spawn({
            let calls = calls.clone();
            until(
                move || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            panic!("boom");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Duration::from_millis(100),
                rx,
            )
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_until_stops_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        until(
            || async {
                panic!("must not run");
            },
            Duration::from_millis(1),
            rx,
        )
        .await;
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
