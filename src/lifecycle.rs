//! Start/stop bookkeeping shared by the long-running sources.

use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;

/// Running flag plus the cancellation token of the current run.
///
/// `begin` and `stop` both take the token lock, so a stop racing with startup
/// always cancels the token the new run observes.
#[derive(Debug)]
pub(crate) struct SourceControl {
    cancel: Mutex<CancellationToken>,
    running: watch::Sender<bool>,
}

impl SourceControl {
    pub(crate) fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            cancel: Mutex::new(CancellationToken::new()),
            running,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Mark the source running and hand out a fresh token. The returned guard
    /// clears the flag when dropped, however the run ends.
    pub(crate) fn begin(&self) -> Result<(CancellationToken, RunGuard<'_>), SourceError> {
        let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let started = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !started {
            return Err(SourceError::AlreadyRunning);
        }
        *current = CancellationToken::new();
        Ok((current.clone(), RunGuard { control: self }))
    }

    /// Cancel the current run and wait until it has finished. Returns `false`
    /// when nothing was running.
    pub(crate) async fn stop(&self) -> bool {
        {
            let current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_running() {
                return false;
            }
            current.cancel();
        }
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
        true
    }
}

pub(crate) struct RunGuard<'a> {
    control: &'a SourceControl,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.control.running.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_begin_twice_fails_until_guard_dropped() {
        let control = SourceControl::new();
        let (token, guard) = control.begin().unwrap();
        assert!(control.is_running());
        assert!(matches!(control.begin(), Err(SourceError::AlreadyRunning)));

        drop(guard);
        assert!(!control.is_running());
        assert!(!token.is_cancelled());
        assert!(control.begin().is_ok());
    }

    #[tokio::test]
    async fn test_stop_waits_for_run_to_end() {
        let control = Arc::new(SourceControl::new());
        assert!(!control.stop().await);

        let runner = control.clone();
        let task = tokio::spawn(async move {
            let (token, _guard) = runner.begin().unwrap();
            token.cancelled().await;
        });
        while !control.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(control.stop().await);
        assert!(!control.is_running());
        task.await.unwrap();
    }
}
