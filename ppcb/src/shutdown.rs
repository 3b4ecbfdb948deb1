//! Cancellation signal shared by every blocking wait.
//!
//! [`Trigger`] is held by whoever decides to stop (the Ctrl-C handler in
//! `main.rs`, or a test).  Each session owns a [`Shutdown`] clone and checks
//! it before every send/receive attempt and races it against every wait, so
//! a cancelled session unwinds through its normal `Err` path and drops its
//! socket and buffers.

use std::future::Future;

use tokio::sync::watch;

use crate::connection::ConnError;

/// Create a connected trigger / listener pair.
pub fn channel() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx }, Shutdown { rx })
}

/// Sending half: fires the cancellation once.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

impl Trigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no live receivers.
        self.tx.send_replace(true);
    }
}

/// Receiving half, cloned into every session.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A listener that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail fast with [`ConnError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<(), ConnError> {
        if self.is_cancelled() {
            Err(ConnError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested.  Pends forever when the
    /// trigger was dropped without firing.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancellation arrives first.
    pub async fn guard<T, E, F>(&mut self, fut: F) -> Result<T, ConnError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ConnError>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ConnError::Cancelled),
            res = fut => res.map_err(Into::into),
        }
    }
}
