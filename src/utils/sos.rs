use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stop signal shared between the signal handler and the control loop.
///
/// Clones observe the same underlying token, so cancelling any clone
/// stops every waiter.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn wait_cancellation(&self) {
        self.token.cancelled().await
    }

    /// Sleeps for `duration` unless a stop arrives first.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// sleep was cut short by a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.cancelled(),
        }
    }
}
