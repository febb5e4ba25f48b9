//! Waiting on long-running remote operations.
//!
//! VirtualBox has no push notification for clone, power and delete
//! operations; it hands back an `IProgress` handle that must be polled.
//! [`Session::wait_progress`] is an explicit bounded loop with two
//! independent exits checked before every poll:
//!
//! 1. the caller's cancellation token ([`ClientError::Cancelled`]), and
//! 2. our own wall-clock deadline ([`ClientError::Timeout`]).
//!
//! A single slow poll can still overrun the deadline, but no poll starts
//! after it.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use super::session::Session;
use super::ClientError;
use crate::infrastructure::vbox_api::ProgressRef;

/// Fixed delay between completion polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl Session<'_> {
    /// Polls `progress` until it completes, the deadline passes, or the
    /// operation is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Cancelled`] / [`ClientError::Timeout`] as above.
    /// - [`ClientError::ProgressFailed`] if the operation finished with a
    ///   non-zero result code.  The remote error text is attached when it can
    ///   be read.
    /// - [`ClientError::Remote`] if a poll itself fails.
    pub(crate) async fn wait_progress(&self, progress: &ProgressRef, timeout: Duration) -> Result<(), ClientError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if Instant::now() > deadline {
                return Err(ClientError::Timeout(timeout));
            }

            let completed = self
                .call("check operation progress", self.api.get_progress_completed(progress))
                .await?;
            if completed {
                break;
            }

            debug!(
                progress = %progress,
                elapsed_secs = started.elapsed().as_secs(),
                "operation still running"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = sleep(POLL_INTERVAL) => {}
            }
        }

        let result_code = self
            .call("read operation result", self.api.get_progress_result_code(progress))
            .await?;
        if result_code == 0 {
            return Ok(());
        }

        let text = match self.race(self.api.get_progress_error_text(progress)).await? {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "could not read operation error text");
                None
            }
        };
        Err(ClientError::ProgressFailed { result_code, text })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::infrastructure::vbox_api::{ApiError, MockVBoxApi, SessionRef};

    fn progress() -> ProgressRef {
        ProgressRef::new("progress-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_polls_until_complete() {
        // Arrange: incomplete, incomplete, complete
        let mut api = MockVBoxApi::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        api.expect_get_progress_completed().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(n >= 2)
        });
        api.expect_get_progress_result_code().times(1).returning(|_| Ok(0));
        let cancel = CancellationToken::new();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);
        let start = Instant::now();

        // Act
        let result = session.wait_progress(&progress(), Duration::from_secs(60)).await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_times_out_without_polling_past_deadline() {
        // Arrange: never completes
        let mut api = MockVBoxApi::new();
        api.expect_get_progress_completed()
            .times(3)
            .returning(|_| Ok(false));
        let cancel = CancellationToken::new();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);

        // Act: polls at t=0, 2, 4; at t=6 the deadline has passed
        let result = session.wait_progress(&progress(), Duration::from_secs(5)).await;

        // Assert
        match result {
            Err(ClientError::Timeout(d)) => assert_eq!(d, Duration::from_secs(5)),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_cancelled_before_start_makes_no_calls() {
        let api = MockVBoxApi::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);

        let result = session.wait_progress(&progress(), Duration::from_secs(60)).await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_cancel_interrupts_sleep() {
        // Arrange
        let mut api = MockVBoxApi::new();
        api.expect_get_progress_completed()
            .times(2)
            .returning(|_| Ok(false));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let session = Session::new(&api, SessionRef::new("s"), &cancel);
        let start = Instant::now();

        // Act
        let result = session.wait_progress(&progress(), Duration::from_secs(60)).await;

        // Assert: cancellation, not timeout, and no wait for the next tick
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_failure_carries_error_text() {
        let mut api = MockVBoxApi::new();
        api.expect_get_progress_completed().returning(|_| Ok(true));
        api.expect_get_progress_result_code()
            .returning(|_| Ok(0x80bb0005u32 as i32));
        api.expect_get_progress_error_text()
            .returning(|_| Ok("Could not open the medium".to_string()));
        let cancel = CancellationToken::new();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);

        let err = session
            .wait_progress(&progress(), Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            ClientError::ProgressFailed { result_code, text } => {
                assert_eq!(result_code, 0x80bb0005u32 as i32);
                assert_eq!(text.as_deref(), Some("Could not open the medium"));
            }
            other => panic!("expected ProgressFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_failure_without_enrichment_is_bare_code() {
        let mut api = MockVBoxApi::new();
        api.expect_get_progress_completed().returning(|_| Ok(true));
        api.expect_get_progress_result_code().returning(|_| Ok(1));
        api.expect_get_progress_error_text()
            .returning(|_| Err(ApiError::Transport("connection reset".into())));
        let cancel = CancellationToken::new();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);

        let err = session
            .wait_progress(&progress(), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::ProgressFailed { result_code: 1, text: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_progress_poll_failure_is_remote_error() {
        let mut api = MockVBoxApi::new();
        api.expect_get_progress_completed()
            .returning(|_| Err(ApiError::fault("Invalid managed object reference")));
        let cancel = CancellationToken::new();
        let session = Session::new(&api, SessionRef::new("s"), &cancel);

        let err = session
            .wait_progress(&progress(), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Remote { .. }));
    }
}
