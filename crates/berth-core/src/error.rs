//! Construction-time error taxonomy for Berth.
//!
//! Every variant here is raised while a topology is being assembled, before
//! any template is written. Runtime failures (stage failures, health checks)
//! live in `berth-ci`.

/// Pipeline wiring errors: artifact hand-off problems detected while a
/// pipeline is being built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WiringError {
    #[error("pipeline {pipeline} needs at least two stages, found {found}")]
    TooFewStages { pipeline: String, found: usize },

    #[error("stage {stage} in pipeline {pipeline} has no actions")]
    EmptyStage { pipeline: String, stage: String },

    #[error("duplicate stage name {stage} in pipeline {pipeline}")]
    DuplicateStage { pipeline: String, stage: String },

    #[error("duplicate action name {action} in pipeline {pipeline}")]
    DuplicateAction { pipeline: String, action: String },

    #[error("source action {action} must be in the first stage, found in {stage}")]
    SourceNotFirst { action: String, stage: String },

    #[error("stage {stage} has no source action; the first stage must fetch source")]
    MissingSource { stage: String },

    #[error("artifact {artifact} is produced by both {first} and {second}")]
    DuplicateProducer {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("action {action} consumes artifact {artifact}, which no earlier stage produces")]
    DanglingInput { action: String, artifact: String },

    #[error("artifact {artifact} is produced and consumed within stage {stage}")]
    SameStageHandoff { artifact: String, stage: String },

    #[error("stage {stage} does not advance the pipeline past {previous}")]
    StateRegression { stage: String, previous: String },

    #[error("artifact {artifact} is consumed by both {first} and {second}")]
    MultipleConsumers {
        artifact: String,
        first: String,
        second: String,
    },
}

/// Berth construction errors.
#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    #[error("scope violation: {reason} (actions: {})", actions.join(", "))]
    ScopeViolation { actions: Vec<String>, reason: String },

    #[error("wiring error: {0}")]
    Wiring(#[from] WiringError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate construct id {id} under {parent}")]
    DuplicateConstruct { parent: String, id: String },

    #[error("duplicate export {0}")]
    DuplicateExport(String),

    #[error("unknown export {0}")]
    UnknownExport(String),

    #[error("duplicate logical id {0} in template")]
    DuplicateResource(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("network invariant violated: {0}")]
    NetworkInvariant(String),

    #[error("rollout error: {0}")]
    Rollout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Berth construction.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_violation_lists_actions() {
        let err = BerthError::ScopeViolation {
            actions: vec!["ecr:PutImage".to_string(), "s3:PutObject".to_string()],
            reason: "mutating actions require a resource".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("scope violation"));
        assert!(msg.contains("ecr:PutImage, s3:PutObject"));
    }

    #[test]
    fn test_wiring_error_converts() {
        let err: BerthError = WiringError::DanglingInput {
            action: "Build".to_string(),
            artifact: "source".to_string(),
        }
        .into();
        assert!(matches!(err, BerthError::Wiring(_)));
        assert!(err.to_string().contains("no earlier stage produces"));
    }
}
