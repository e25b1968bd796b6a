use thiserror::Error;

use crate::repository::RunId;

/// Failures callers are expected to branch on. Everything else travels as a
/// plain `anyhow::Error` with context attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} is not configured")]
    MissingConfig(&'static str),

    #[error("no stages provided")]
    NoStages,

    #[error("pipeline service did not confirm creation of {0}")]
    PipelineNotConfirmed(String),

    #[error("continuation token {0} was already redeemed")]
    TokenAlreadyRedeemed(String),

    #[error("continuation token {0} is not known to this run")]
    UnknownToken(String),

    #[error("object {0} has no body")]
    MissingObjectBody(String),

    #[error("run {0} is not registered")]
    UnknownRun(RunId),
}

impl AuditError {
    /// Recover a typed error from an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&AuditError> {
        err.chain().find_map(|cause| cause.downcast_ref::<AuditError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn find_through_context_layers() {
        let err = Err::<(), _>(AuditError::NoStages)
            .context("creating pipeline")
            .unwrap_err();
        assert_eq!(AuditError::find(&err), Some(&AuditError::NoStages));
    }

    #[test]
    fn find_returns_none_for_untyped_errors() {
        let err = anyhow::anyhow!("connection reset");
        assert!(AuditError::find(&err).is_none());
    }

    #[test]
    fn missing_config_names_the_key() {
        let err = AuditError::MissingConfig("SEND_SUCCESS_LAMBDA");
        assert_eq!(err.to_string(), "SEND_SUCCESS_LAMBDA is not configured");
    }
}
