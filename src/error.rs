//! Error types for search operations

/// Result type for search operations
pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors that can occur while talking to a search service
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Missing endpoint or credential, or an invalid schema
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The service refused to create the index
    #[error("Error creating index: {0}")]
    IndexCreation(String),

    /// The index is still unavailable after the missing-index hook ran
    #[error("Index does not exist: {0}")]
    IndexNotFound(String),

    /// Transient batch failures outlasted the retry budget
    #[error("Indexing of items into '{index}' has exceeded maximum allowable attempts ({attempts})")]
    RetryBudgetExhausted {
        index: String,
        attempts: u32,
    },

    /// Upsert failure that is not worth retrying
    #[error("Document indexing failed: {0}")]
    Indexing(String),

    /// A document did not serialize to a flat field map
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Search or suggest request rejected by the service
    #[error("Search execution failed: {0}")]
    Query(String),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
