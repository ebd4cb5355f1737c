use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::errors::{MsAuthError, Result};
use crate::record::{Authentication, AuthenticationRecord};

/// A way of logging a Microsoft account into Minecraft
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Run the initial, interactive authentication
    async fn authenticate(&self) -> Result<Authentication>;

    /// Authenticate again from a stored record
    async fn reauthenticate(&self, record: &AuthenticationRecord) -> Result<Authentication>;

    /// Abort an in-flight authentication; it fails with `UserCancelled`
    fn stop(&self);

    fn is_authenticating(&self) -> bool;
}

/// Single-flight guard plus cancellation shared by the authenticators
#[derive(Debug)]
pub(crate) struct FlowState {
    running: AtomicBool,
    cancel: watch::Sender<u64>,
}

impl FlowState {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            cancel: watch::Sender::new(0),
        }
    }

    /// Claim the flow; fails if another call holds it
    pub(crate) fn begin(&self) -> Result<FlowGuard<'_>> {
        // Subscribe first so a stop() racing with the claim isn't lost
        let cancelled = self.cancel.subscribe();
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MsAuthError::AlreadyAuthenticating)?;

        Ok(FlowGuard {
            state: self,
            cancelled,
        })
    }

    pub(crate) fn stop(&self) {
        if self.is_running() {
            debug!("Stopping authentication");
            self.cancel.send_modify(|generation| *generation += 1);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub(crate) struct FlowGuard<'a> {
    state: &'a FlowState,
    cancelled: watch::Receiver<u64>,
}

impl FlowGuard<'_> {
    /// Drive `work` until it finishes or [`FlowState::stop`] is called
    pub(crate) async fn run<T>(&mut self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = work => result,
            _ = wait_cancelled(&mut self.cancelled) => Err(MsAuthError::UserCancelled),
        }
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
