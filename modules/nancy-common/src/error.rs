use thiserror::Error;

use crate::validate::ValidationIssue;

/// Errors the orchestrator surfaces to callers. Internal store and plugin
/// failures are mapped into these; backend error types never escape.
#[derive(Error, Debug)]
pub enum NancyError {
    #[error("packet failed validation: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("no plugin registered for file type: {0}")]
    NoPluginForType(String),

    #[error("plugin {0} is not accepting requests")]
    PluginUnhealthy(String),

    #[error("ingest queue or query pool saturated: {0}")]
    Overloaded(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = NancyError::Validation(vec![
            ValidationIssue {
                field: "packet_version".into(),
                message: "unsupported".into(),
            },
            ValidationIssue {
                field: "content".into(),
                message: "empty".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("packet_version"));
        assert!(text.contains("content"));
    }
}
