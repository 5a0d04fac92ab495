/// Error classification driving reconcile phase transitions
use thiserror::Error;

/// Classified failure of a cluster operation.
///
/// The reconciler inspects the classification at the root of an error chain
/// to decide between retrying locally, surfacing in status, or transitioning
/// the cluster to a terminal phase.
#[derive(Debug, Error)]
pub enum OpError {
    /// Retryable right now within the same reconcile (5xx, rate limit,
    /// network timeout). Absorbed by local retry loops.
    #[error("transient: {0}")]
    Transient(String),

    /// Not worth retrying in this reconcile; the next periodic reconcile
    /// will reattempt. Surfaced in status.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Requires operator intervention (bad credentials, malformed request,
    /// secrets mismatch). Transitions the cluster to Failed.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Observed state violates an invariant we refuse to repair
    /// automatically. Transitions the cluster to Degraded.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Cleanup left billable resources behind. Hard failure.
    #[error("cost leak: {0}")]
    CostLeak(String),
}

/// How the reconciler should react to an error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Retryable,
    Permanent,
    Invariant,
    CostLeak,
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Transient(_) => ErrorKind::Transient,
            OpError::Retryable(_) => ErrorKind::Retryable,
            OpError::Permanent(_) => ErrorKind::Permanent,
            OpError::Invariant(_) => ErrorKind::Invariant,
            OpError::CostLeak(_) => ErrorKind::CostLeak,
        }
    }
}

/// Classify an anyhow chain. Unclassified errors default to Retryable so an
/// unknown failure never escalates a cluster to Failed on its own.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(op) = cause.downcast_ref::<OpError>() {
            return op.kind();
        }
    }
    ErrorKind::Retryable
}

pub fn transient(msg: impl Into<String>) -> anyhow::Error {
    OpError::Transient(msg.into()).into()
}

pub fn retryable(msg: impl Into<String>) -> anyhow::Error {
    OpError::Retryable(msg.into()).into()
}

pub fn permanent(msg: impl Into<String>) -> anyhow::Error {
    OpError::Permanent(msg.into()).into()
}

pub fn invariant(msg: impl Into<String>) -> anyhow::Error {
    OpError::Invariant(msg.into()).into()
}

pub fn cost_leak(msg: impl Into<String>) -> anyhow::Error {
    OpError::CostLeak(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_through_context() {
        let err = permanent("bad token").context("creating server");
        assert_eq!(classify(&err), ErrorKind::Permanent);
    }

    #[test]
    fn test_classify_unknown_defaults_to_retryable() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(classify(&err), ErrorKind::Retryable);
    }

    #[test]
    fn test_classify_picks_first_classified_cause() {
        let err = transient("rate limited")
            .context("POST servers")
            .context("provisioning cp-1");
        assert_eq!(classify(&err), ErrorKind::Transient);
    }
}
