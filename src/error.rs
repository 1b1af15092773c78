//! Stable error taxonomy for the proxy, crossing the boundary described in
//! spec §6/§7: callers match on these variants by name, not by message text.

use thiserror::Error;

/// A pick attempt failed for one of these reasons (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PickError {
    /// The underlying set has no elements at all.
    #[error("set is empty")]
    SetEmpty,
    /// The ordered sequence disagrees with the set about emptiness.
    #[error("ordered sequence is empty but set is not")]
    ListEmpty,
    /// The ordered sequence's head/tail links are internally inconsistent.
    #[error("ordered sequence is internally inconsistent")]
    ListInvalid,
    /// Every member is blocked and the picker is in skip-blocked mode.
    #[error("no unblocked element available")]
    NoneAvailable,
    /// A no-repeat picker completed one full sweep.
    #[error("picker arrived back at its starting point")]
    ArrivedEnd,
    /// Defensive cap on forward steps was exceeded.
    #[error("exceeded maximum iteration count")]
    MaxIteration,
}

/// Errors crossing the controller boundary (spec §6).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `RemoveRule`/`AddTarget`/... referenced a rule key that isn't present.
    #[error("rule does not exist: {0}")]
    RuleNotExist(String),
    /// `AddRule` was called with a key that is already present.
    #[error("rule already exists: {0}")]
    RuleAlreadyExist(String),
    /// `RemoveTarget`/`Block` referenced a target not in the rule's set.
    #[error("target does not exist: {0}")]
    TargetNotExist(String),
    /// `AddTarget` was called with a target already present in the rule.
    #[error("target already exists: {0}")]
    TargetAlreadyExist(String),
    /// `RemovePort` referenced a port that has no listener.
    #[error("port does not exist: {0}")]
    PortNotExist(u16),
    /// `AddPort` referenced a port already bound, to this rule or another.
    #[error("port already bound: {0}")]
    PortAlreadyExist(u16),
    /// An invariant the differ is supposed to guarantee was violated.
    ///
    /// Reaching this means a bug upstream of `ApplyOperation`, not a bad
    /// config; it is fatal for the current mutation only.
    #[error("internal integrity violation: {0}")]
    InternalIntegrity(String),
    /// Config ingest rejected a malformed field.
    #[error("verification error on field `{field}`: {message}")]
    VerificationError {
        /// Name of the offending config field.
        field: &'static str,
        /// Human-readable detail.
        message: String,
    },
    /// The kernel-level echo-dispatch accelerator isn't available on this
    /// platform/build. Detected up front via `EchoDispatch::supported` and
    /// meant to influence controller configuration only, not to propagate
    /// out of a live `ApplyOperation` call (spec §7 kind 6).
    #[error("echo-dispatch accelerator not supported on this platform")]
    NotSupported,
    /// A picker operation failed.
    #[error(transparent)]
    Pick(#[from] PickError),
    /// An I/O error that isn't classifiable as an expected "closed" error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns true if `err` is the kind of I/O error expected from closing a
/// listener or connection out from under an in-flight accept/read/write
/// (spec §7 kind 3, "I/O closed" — swallowed, logged at most at debug).
pub fn is_expected_close(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        NotConnected | BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof
    )
}
