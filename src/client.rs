use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{ Arc, Mutex, PoisonError, RwLock };
use std::time::Duration;
use log::{ info, warn, debug };

use crate::db::{
    create_search_backend,
    Document,
    FacetCounts,
    QueryRequest,
    QueryResult,
    RawSearchResponse,
    RemoteStatus,
    SearchBackend,
    SearchServiceConfig,
    SuggestRequest,
};
use crate::error::{ Result, SearchError };
use crate::schema::IndexDefinition;

/// Retry budget used by [`SearchIndexClient::index_items`].
pub const DEFAULT_MAX_RETRIES: u32 = 200;

type Connector = Box<dyn Fn(&SearchServiceConfig) -> Result<Arc<dyn SearchBackend>> + Send + Sync>;

/// Client for one search service instance.
///
/// The backend connection is built on first use and then shared by every
/// operation; concurrent first calls still build exactly one connection.
/// Share the client itself behind an `Arc` rather than creating one per task.
pub struct SearchIndexClient {
    config: SearchServiceConfig,
    connector: Connector,
    connection: RwLock<Option<Arc<dyn SearchBackend>>>,
    init_lock: Mutex<()>,
}

impl SearchIndexClient {
    /// Fails with a configuration error when the endpoint or key is empty.
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        Self::from_config(SearchServiceConfig::new(endpoint, api_key)?)
    }

    pub fn from_config(config: SearchServiceConfig) -> Result<Self> {
        Self::with_connector(config, create_search_backend)
    }

    /// Uses `connector` instead of the backend named in the config.
    pub fn with_connector<C>(config: SearchServiceConfig, connector: C) -> Result<Self>
        where C: Fn(&SearchServiceConfig) -> Result<Arc<dyn SearchBackend>> + Send + Sync + 'static
    {
        config.validate()?;

        Ok(Self {
            config,
            connector: Box::new(connector),
            connection: RwLock::new(None),
            init_lock: Mutex::new(()),
        })
    }

    /// Wraps an already constructed backend.
    pub fn with_backend(config: SearchServiceConfig, backend: Arc<dyn SearchBackend>) -> Result<Self> {
        Self::with_connector(config, move |_| Ok(Arc::clone(&backend)))
    }

    pub fn config(&self) -> &SearchServiceConfig {
        &self.config
    }

    fn cached_connection(&self) -> Option<Arc<dyn SearchBackend>> {
        self.connection.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(Arc::clone)
    }

    fn connection(&self) -> Result<Arc<dyn SearchBackend>> {
        if let Some(conn) = self.cached_connection() {
            return Ok(conn);
        }

        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = self.cached_connection() {
            return Ok(conn);
        }

        let conn = (self.connector)(&self.config)?;
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&conn));
        info!("Search connection established for {}", self.config.endpoint);
        Ok(conn)
    }

    /// Creates the index and then waits `creation_delay` so the service can
    /// propagate it before documents or queries arrive.
    ///
    /// An index that already exists counts as success.
    pub async fn create_index(
        &self,
        definition: &IndexDefinition,
        creation_delay: Duration
    ) -> Result<bool> {
        definition.validate()?;
        let conn = self.connection()?;

        let status = conn
            .create_index(definition).await
            .map_err(|e| SearchError::IndexCreation(e.to_string()))?;

        match status {
            RemoteStatus::Created | RemoteStatus::Ok | RemoteStatus::AlreadyExists => {
                info!("Index '{}' ready ({:?})", definition.name, status);
                if !creation_delay.is_zero() {
                    debug!("Holding {:?} for index '{}' to propagate", creation_delay, definition.name);
                    tokio::time::sleep(creation_delay).await;
                }
                Ok(true)
            }
            RemoteStatus::BatchPartialFailure(detail) |
            RemoteStatus::TransientError(detail) |
            RemoteStatus::Error(detail) => Err(SearchError::IndexCreation(detail)),
        }
    }

    /// Blocking form of [`create_index`](Self::create_index).
    ///
    /// Runs on a private runtime, so it must not be called from async code.
    pub fn create_index_blocking(
        &self,
        definition: &IndexDefinition,
        creation_delay: Duration
    ) -> Result<bool> {
        block_on(self.create_index(definition, creation_delay))?
    }

    /// Best effort: any failure, including a missing index, yields `false`.
    pub async fn delete_index(&self, name: &str) -> bool {
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Could not delete index '{}': {}", name, e);
                return false;
            }
        };
        match conn.delete_index(name).await {
            Ok(status) if status.is_success() => {
                info!("Deleted index '{}'", name);
                true
            }
            Ok(status) => {
                warn!("Delete of index '{}' not accepted: {:?}", name, status);
                false
            }
            Err(e) => {
                warn!("Delete of index '{}' failed: {}", name, e);
                false
            }
        }
    }

    pub fn delete_index_blocking(&self, name: &str) -> bool {
        block_on(self.delete_index(name)).unwrap_or(false)
    }

    pub async fn index_exists(&self, name: &str) -> Result<bool> {
        self.connection()?.index_exists(name).await
    }

    /// [`index_items_with_retries`](Self::index_items_with_retries) with
    /// [`DEFAULT_MAX_RETRIES`].
    pub async fn index_items<T, F, Fut>(
        &self,
        index_name: &str,
        items: &[T],
        on_missing_index: F
    ) -> Result<bool>
        where T: Serialize, F: FnOnce(String) -> Fut, Fut: Future<Output = Result<()>>
    {
        self.index_items_with_retries(index_name, items, on_missing_index, DEFAULT_MAX_RETRIES).await
    }

    /// Upserts `items` as a single batch.
    ///
    /// `on_missing_index` runs once, before any upload, when the index does not
    /// exist yet. Transient batch failures resend the identical batch up to
    /// `max_retries` times; upserts are keyed, so a resent batch overwrites
    /// whatever part of it the service already stored.
    pub async fn index_items_with_retries<T, F, Fut>(
        &self,
        index_name: &str,
        items: &[T],
        on_missing_index: F,
        max_retries: u32
    ) -> Result<bool>
        where T: Serialize, F: FnOnce(String) -> Fut, Fut: Future<Output = Result<()>>
    {
        let conn = self.connection()?;

        if !conn.index_exists(index_name).await? {
            info!("Index '{}' does not exist, running missing-index hook", index_name);
            on_missing_index(index_name.to_string()).await?;
            if !conn.index_exists(index_name).await? {
                return Err(SearchError::IndexNotFound(index_name.to_string()));
            }
        }

        let documents = to_documents(items)?;
        let mut remaining = max_retries;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match conn.upload_documents(index_name, &documents).await? {
                RemoteStatus::Ok | RemoteStatus::Created => {
                    debug!(
                        "Indexed {} items into '{}' after {} attempt(s)",
                        documents.len(),
                        index_name,
                        attempts
                    );
                    return Ok(true);
                }
                RemoteStatus::AlreadyExists => {
                    return Ok(false);
                }
                status if status.is_transient() => {
                    if remaining == 0 {
                        return Err(SearchError::RetryBudgetExhausted {
                            index: index_name.to_string(),
                            attempts,
                        });
                    }
                    remaining -= 1;
                    warn!(
                        "Transient failure indexing into '{}' (attempt {}, {} retries left): {:?}",
                        index_name,
                        attempts,
                        remaining,
                        status
                    );
                }
                RemoteStatus::Error(detail) |
                RemoteStatus::BatchPartialFailure(detail) |
                RemoteStatus::TransientError(detail) => {
                    return Err(SearchError::Indexing(detail));
                }
            }
        }
    }

    async fn execute_query(&self, index_name: &str, request: &QueryRequest) -> Result<RawSearchResponse> {
        let raw = self.connection()?.search(index_name, request).await?;
        debug!(
            "Search on '{}' returned {} documents (total {:?})",
            index_name,
            raw.documents.len(),
            raw.total_count
        );
        Ok(raw)
    }

    /// Runs one search round trip and hands the pieces to the caller.
    ///
    /// Each document is deserialized as `T` and passed through `project`, in
    /// the order the service returned them. When facets were requested,
    /// `on_facet` is called once per facet in response order. `on_count`
    /// is always called exactly once, with `None` unless a total count was
    /// requested.
    pub async fn search<T, R, P, F, C>(
        &self,
        index_name: &str,
        request: &QueryRequest,
        mut project: P,
        mut on_facet: F,
        on_count: C
    ) -> Result<Vec<R>>
        where
            T: DeserializeOwned,
            P: FnMut(T) -> R,
            F: FnMut(&str, FacetCounts),
            C: FnOnce(Option<i64>)
    {
        let raw = self.execute_query(index_name, request).await?;

        let results = raw.documents
            .into_iter()
            .map(|doc| from_document::<T>(doc).map(&mut project))
            .collect::<Result<Vec<R>>>()?;

        if request.facet_fields.is_some() {
            for (field, counts) in raw.facets {
                on_facet(&field, counts);
            }
        }
        on_count(raw.total_count);
        Ok(results)
    }

    /// Runs one search round trip and returns everything as a value.
    pub async fn query<T: DeserializeOwned>(
        &self,
        index_name: &str,
        request: &QueryRequest
    ) -> Result<QueryResult<T>> {
        let raw = self.execute_query(index_name, request).await?;
        let documents = raw.documents.into_iter().map(from_document).collect::<Result<Vec<T>>>()?;
        Ok(QueryResult {
            documents,
            facets: raw.facets,
            total_count: raw.total_count,
        })
    }

    /// Autocomplete against the suggester named in `request`. Not retried.
    pub async fn suggest<T, R, P>(
        &self,
        index_name: &str,
        request: &SuggestRequest,
        project: P
    ) -> Result<Vec<R>>
        where T: DeserializeOwned, P: FnMut(T) -> R
    {
        let docs = self.connection()?.suggest(index_name, request).await?;
        debug!("Suggest '{}' on '{}' returned {} documents", request.search_text, index_name, docs.len());
        docs.into_iter()
            .map(from_document::<T>)
            .collect::<Result<Vec<T>>>()
            .map(|items| items.into_iter().map(project).collect())
    }
}

fn to_documents<T: Serialize>(items: &[T]) -> Result<Vec<Document>> {
    items
        .iter()
        .map(|item| {
            match serde_json::to_value(item)? {
                Value::Object(map) => Ok(map),
                other =>
                    Err(
                        SearchError::InvalidDocument(
                            format!("expected a field map, got {}", other)
                        )
                    ),
            }
        })
        .collect()
}

fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    Ok(runtime.block_on(future))
}
