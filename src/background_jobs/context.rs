use crate::engine::PriceEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Contains the shared engine and a cancellation token
/// for graceful shutdown handling.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// The price engine the jobs drive.
    pub engine: Arc<PriceEngine>,
}

impl JobContext {
    /// Create a new job context with the given dependencies.
    pub fn new(cancellation_token: CancellationToken, engine: Arc<PriceEngine>) -> Self {
        Self {
            cancellation_token,
            engine,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Jobs should periodically check this during long-running operations
    /// and return early with `JobError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
