pub mod client;
pub mod db;
pub mod error;
pub mod schema;
pub use client::{ SearchIndexClient, DEFAULT_MAX_RETRIES };
pub use db::{
    SearchBackend,
    create_search_backend,
    get_backend_type,
    BackendType,
    SearchServiceConfig,
    QueryRequest,
    QueryResult,
    SuggestRequest,
    RemoteStatus,
    Document,
    FacetCounts,
};
pub use error::{ Result, SearchError };
pub use schema::{ FieldSchema, IndexDefinition, LogicalType, SchemaFile, SuggesterDefinition };
