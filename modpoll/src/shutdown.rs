//! Process-wide shutdown flag, adapted from the `Shutdown` listener in mini-redis.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

type Notify = broadcast::Receiver<()>;

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value is
/// ever sent; dropping the sender counts as a signal too. Once observed, the
/// flag stays set for the rest of the run.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` once the shutdown signal has been received
    shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: Notify,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Shutdown {
    pub fn new(notify: Notify) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received, checking the
    /// channel without waiting.
    pub fn is_shutdown(&mut self) -> bool {
        if !self.shutdown {
            match self.notify.try_recv() {
                Err(TryRecvError::Empty) => {}
                // A value, a lag or a dropped sender all mean "stop".
                _ => self.shutdown = true,
            }
        }
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }

    /// Sleep for `duration` unless shutdown is signalled first.
    ///
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.recv() => false,
        }
    }
}

impl From<Notify> for Shutdown {
    fn from(notify: Notify) -> Self {
        Self::new(notify)
    }
}

#[tokio::test]
async fn flag_is_sticky_once_signalled() {
    let (tx, rx) = broadcast::channel(1);
    let mut shutdown = Shutdown::new(rx);
    assert!(!shutdown.is_shutdown());

    tx.send(()).unwrap();
    assert!(shutdown.is_shutdown());
    assert!(shutdown.is_shutdown());
}

#[tokio::test]
async fn dropped_sender_counts_as_shutdown() {
    let (tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    drop(tx);
    assert!(shutdown.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn sleep_is_interrupted_by_signal() {
    let (tx, rx) = broadcast::channel(1);
    let mut shutdown = Shutdown::new(rx);

    let sleeper = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await });
    tokio::task::yield_now().await;
    tx.send(()).unwrap();

    assert!(!sleeper.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn sleep_completes_without_signal() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    assert!(shutdown.sleep(Duration::from_millis(500)).await);
}
