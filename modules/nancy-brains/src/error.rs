use thiserror::Error;

/// Failure taxonomy the router keys its recovery on. Adapters classify
/// backend errors into this at the boundary; raw sqlx/neo4rs/provider
/// errors never cross it.
#[derive(Error, Debug)]
pub enum BrainError {
    /// Network, timeout, capacity. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Schema mismatch, constraint violation. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The backing process or connection is gone. The adapter is marked
    /// unhealthy and skipped until it recovers.
    #[error("catastrophic: {0}")]
    Catastrophic(String),

    /// Search issued under a different embedding model than the store was
    /// written with. Permanent-class.
    #[error("embedding model mismatch: store tagged {stored:?}, configured {configured:?}")]
    ModelMismatch { stored: String, configured: String },

    /// The adapter is currently marked unhealthy and the call was skipped.
    #[error("adapter unavailable: {0}")]
    Unavailable(String),

    /// The linguistic adapter exhausted its provider retry budget.
    #[error("llm unavailable after {attempts} attempts: {reason}")]
    LlmUnavailable { attempts: u32, reason: String },
}

impl BrainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrainError::Transient(_))
    }

    /// Permanent-class failures are recorded in the packet result and never
    /// retried within a routing pass.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BrainError::Permanent(_) | BrainError::ModelMismatch { .. }
        )
    }

    pub fn is_catastrophic(&self) -> bool {
        matches!(self, BrainError::Catastrophic(_))
    }
}

impl From<llm_client::LlmError> for BrainError {
    fn from(err: llm_client::LlmError) -> Self {
        match err {
            llm_client::LlmError::Unavailable { attempts, reason } => {
                BrainError::LlmUnavailable { attempts, reason }
            }
            llm_client::LlmError::Provider(msg) => BrainError::Permanent(msg),
            llm_client::LlmError::MalformedResponse(msg) => BrainError::Permanent(msg),
        }
    }
}

impl From<sqlx::Error> for BrainError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
                BrainError::Transient(err.to_string())
            }
            sqlx::Error::PoolClosed => BrainError::Catastrophic(err.to_string()),
            _ => BrainError::Permanent(err.to_string()),
        }
    }
}

impl From<neo4rs::Error> for BrainError {
    // The driver's error surface is coarse; classification goes by the
    // rendered message rather than variant shape.
    fn from(err: neo4rs::Error) -> Self {
        let text = err.to_string();
        let lowered = text.to_lowercase();
        if lowered.contains("connection") || lowered.contains("pool") {
            BrainError::Catastrophic(text)
        } else if lowered.contains("io error") || lowered.contains("timed out") {
            BrainError::Transient(text)
        } else {
            BrainError::Permanent(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_mismatch_is_permanent_class() {
        let err = BrainError::ModelMismatch {
            stored: "a".into(),
            configured: "b".into(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_transient());
        assert!(!err.is_catastrophic());
    }

    #[test]
    fn llm_unavailable_maps_through() {
        let err: BrainError = llm_client::LlmError::Unavailable {
            attempts: 4,
            reason: "503".into(),
        }
        .into();
        assert!(matches!(
            err,
            BrainError::LlmUnavailable { attempts: 4, .. }
        ));
    }
}
