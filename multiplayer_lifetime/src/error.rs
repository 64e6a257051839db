// Misuse errors for the lifetime kernel.

use thiserror::Error;

/// Returned when a `Deferred` is settled a second time. This is a programming
/// error on the producer side, never a recoverable runtime condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("promise was already resolved")]
    AlreadyResolved,
    #[error("promise was already rejected")]
    AlreadyRejected,
}
