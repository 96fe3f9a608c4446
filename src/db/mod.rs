pub mod azure;
mod filter;
pub mod memory;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{ Map, Value };
use std::sync::Arc;
use log::info;

use crate::error::{ Result, SearchError };
use crate::schema::IndexDefinition;

pub const DEFAULT_API_VERSION: &str = "2020-06-30";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A stored document as the service sees it: a flat field-name-to-value map.
pub type Document = Map<String, Value>;

/// Distinct facet values (stringified) and how often each occurs, in the
/// order the service returned the buckets.
pub type FacetCounts = IndexMap<String, i64>;

/// Outcome category of a remote write, decided once by the backend.
///
/// Retry decisions in the client depend only on this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Ok,
    Created,
    AlreadyExists,
    BatchPartialFailure(String),
    TransientError(String),
    Error(String),
}

impl RemoteStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RemoteStatus::Ok | RemoteStatus::Created)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteStatus::BatchPartialFailure(_) | RemoteStatus::TransientError(_))
    }
}

/// One search round trip. Absent options are left out of the request so the
/// service's own defaults apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRequest {
    #[serde(rename = "search")]
    pub search_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(rename = "facets", skip_serializing_if = "Option::is_none")]
    pub facet_fields: Option<Vec<String>>,
    #[serde(rename = "count", skip_serializing_if = "Option::is_none")]
    pub include_total_count: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl QueryRequest {
    /// `"*"` matches every document.
    pub fn new(search_text: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            ..Default::default()
        }
    }

    pub fn match_all() -> Self {
        Self::new("*")
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        // an empty filter means "no filter", not an invalid expression
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }

    pub fn facets<I, S>(mut self, fields: I) -> Self
        where I: IntoIterator<Item = S>, S: Into<String>
    {
        self.facet_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn include_total_count(mut self, include: bool) -> Self {
        self.include_total_count = Some(include);
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Autocomplete request against a named suggester.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestRequest {
    #[serde(rename = "search")]
    pub search_text: String,
    #[serde(rename = "suggesterName")]
    pub suggester_name: String,
    pub top: usize,
    pub fuzzy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl SuggestRequest {
    pub fn new(suggester_name: impl Into<String>, search_text: impl Into<String>, top: usize) -> Self {
        Self {
            search_text: search_text.into(),
            suggester_name: suggester_name.into(),
            top,
            fuzzy: false,
            filter: None,
        }
    }

    pub fn fuzzy(mut self, fuzzy: bool) -> Self {
        self.fuzzy = fuzzy;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }
}

/// Search response before documents are mapped to the caller's type.
#[derive(Debug, Clone, Default)]
pub struct RawSearchResponse {
    pub documents: Vec<Document>,
    /// In response order.
    pub facets: Vec<(String, FacetCounts)>,
    pub total_count: Option<i64>,
}

/// Typed search response.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub documents: Vec<T>,
    pub facets: Vec<(String, FacetCounts)>,
    pub total_count: Option<i64>,
}

impl<T> QueryResult<T> {
    pub fn facet(&self, field: &str) -> Option<&FacetCounts> {
        self.facets
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, counts)| counts)
    }
}

/// Request/response contract with a remote search service.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<RemoteStatus>;

    async fn delete_index(&self, name: &str) -> Result<RemoteStatus>;

    async fn index_exists(&self, name: &str) -> Result<bool>;

    /// Upserts the whole batch by key.
    async fn upload_documents(&self, index: &str, documents: &[Document]) -> Result<RemoteStatus>;

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<RawSearchResponse>;

    async fn suggest(&self, index: &str, request: &SuggestRequest) -> Result<Vec<Document>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Azure,
    Memory,
}

#[derive(Clone, Debug)]
pub struct SearchServiceConfig {
    pub backend_type: BackendType,
    /// Service name or full URL.
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub timeout_secs: u64,
}

impl SearchServiceConfig {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        let config = Self {
            backend_type: BackendType::Azure,
            endpoint: endpoint.trim().to_string(),
            api_key: api_key.trim().to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(
                SearchError::Configuration(
                    "Cannot create search context without service name or key settings".into()
                )
            );
        }
        Ok(())
    }

    /// Reads endpoint and key from the named environment variables.
    pub fn from_env(endpoint_var: &str, api_key_var: &str) -> Result<Self> {
        let endpoint = std::env::var(endpoint_var).unwrap_or_default();
        let api_key = std::env::var(api_key_var).unwrap_or_default();
        Self::new(&endpoint, &api_key).map_err(|_| {
            SearchError::Configuration(
                format!("Environment variables {} and {} must both be set", endpoint_var, api_key_var)
            )
        })
    }

    pub fn with_backend(mut self, backend_type: BackendType) -> Self {
        self.backend_type = backend_type;
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Bare service names expand to the hosted service's domain.
    pub fn base_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}.search.windows.net", self.endpoint)
        }
    }
}

pub fn create_search_backend(config: &SearchServiceConfig) -> Result<Arc<dyn SearchBackend>> {
    info!("Creating search backend of type: {:?}", config.backend_type);
    match config.backend_type {
        BackendType::Azure => {
            let backend = azure::AzureSearchBackend::new(config)?;
            Ok(Arc::new(backend))
        }
        BackendType::Memory => Ok(Arc::new(memory::InMemorySearchBackend::new())),
    }
}

pub fn get_backend_type(type_str: &str) -> Result<BackendType> {
    match type_str.to_lowercase().as_str() {
        "azure" | "azuresearch" | "azure-search" => Ok(BackendType::Azure),
        "memory" | "in-memory" => Ok(BackendType::Memory),
        _ => Err(SearchError::Configuration(format!("Unsupported search backend type: {}", type_str))),
    }
}
