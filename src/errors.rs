//! Gateway error taxonomy
//!
//! Typed errors for the policy merge, loop dispatch and spec compilation
//! paths. Each kind maps to the HTTP status it surfaces as; stages translate
//! them into the JSON error envelope.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("policy not found: {0:?}")]
    PolicyNotFound(String),

    #[error("attempting to apply policy from different organisation to key, skipping")]
    PolicyCrossOrg,

    #[error("cannot apply policy {0} which has per_api and any of partitions set")]
    PolicyPartitionConflict(String),

    #[error("cannot apply multiple policies when some have per_api set and some are partitioned")]
    PolicyMixedModes,

    #[error("access to this API has been disallowed")]
    SessionMissing,

    #[error("key not authorised")]
    KeyTooShort,

    #[error("loop level too deep, found more than {0} loops in single request")]
    LoopTooDeep(u32),

    #[error("can't detect loop target")]
    LoopUnknownTarget,

    #[error("invalid API definition: {0}")]
    SpecInvalid(String),

    #[error("middleware configuration load failed: {0}")]
    ConfigLoad(String),
}

impl GatewayError {
    /// HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PolicyNotFound(_)
            | GatewayError::PolicyCrossOrg
            | GatewayError::PolicyPartitionConflict(_)
            | GatewayError::PolicyMixedModes
            | GatewayError::LoopTooDeep(_)
            | GatewayError::LoopUnknownTarget
            | GatewayError::SpecInvalid(_)
            | GatewayError::ConfigLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::SessionMissing | GatewayError::KeyTooShort => StatusCode::FORBIDDEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::PolicyNotFound("p1".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayError::SessionMissing.status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::KeyTooShort.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::LoopTooDeep(5).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
