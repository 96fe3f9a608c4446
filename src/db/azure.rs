use async_trait::async_trait;
use reqwest::{ Client, Method, RequestBuilder, StatusCode };
use reqwest::header::{ ACCEPT, CONTENT_TYPE };
use serde::Deserialize;
use serde_json::{ json, Map, Value };
use std::time::Duration;
use log::{ info, error, warn, debug };

use super::{
    Document,
    FacetCounts,
    QueryRequest,
    RawSearchResponse,
    RemoteStatus,
    SearchBackend,
    SearchServiceConfig,
    SuggestRequest,
};
use crate::error::{ Result, SearchError };
use crate::schema::IndexDefinition;

const UPLOAD_ACTION: &str = "upload";
const SUGGESTER_SEARCH_MODE: &str = "analyzingInfixMatching";

#[derive(Debug, Deserialize)]
struct FacetBucket {
    value: Value,
    count: i64,
}

#[derive(Debug, Deserialize)]
struct SearchResponseBody {
    #[serde(rename = "@odata.count")]
    count: Option<i64>,
    #[serde(rename = "@search.facets")]
    facets: Option<Map<String, Value>>,
    #[serde(default)]
    value: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct SuggestResponseBody {
    #[serde(default)]
    value: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct IndexingResult {
    key: String,
    status: bool,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndexingResponseBody {
    #[serde(default)]
    value: Vec<IndexingResult>,
}

/// Backend for the hosted Azure Cognitive Search REST API.
pub struct AzureSearchBackend {
    client: Client,
    base_url: String,
    api_key: String,
    api_version: String,
}

impl AzureSearchBackend {
    pub fn new(config: &SearchServiceConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        let base_url = config.base_url();

        info!("Initializing search client for {} (api-version {})", base_url, config.api_version);

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.api_key)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
    }

    fn index_definition_body(definition: &IndexDefinition) -> Value {
        let fields: Vec<Value> = definition.fields
            .iter()
            .map(|f| {
                json!({
                "name": f.name,
                "type": f.logical_type.native_type(),
                "key": f.is_key,
                "searchable": f.is_searchable,
                "filterable": f.is_filterable,
                "sortable": f.is_sortable,
                "facetable": f.is_facetable,
                "retrievable": f.is_retrievable
            })
            })
            .collect();

        let suggesters: Vec<Value> = definition.suggester
            .iter()
            .map(|s| {
                json!({
                "name": s.name,
                "searchMode": SUGGESTER_SEARCH_MODE,
                "sourceFields": s.source_field_names
            })
            })
            .collect();

        json!({
            "name": definition.name,
            "fields": fields,
            "suggesters": suggesters
        })
    }

    /// Strips `@search.*` annotations so only stored fields remain.
    fn clean_document(mut doc: Document) -> Document {
        doc.retain(|k, _| !k.starts_with("@search."));
        doc
    }

    fn facet_value_to_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn parse_facets(raw: Map<String, Value>) -> Result<Vec<(String, FacetCounts)>> {
        let mut facets = Vec::with_capacity(raw.len());
        for (field, buckets) in raw {
            let buckets: Vec<FacetBucket> = serde_json::from_value(buckets)?;
            let counts = buckets
                .into_iter()
                .map(|b| (Self::facet_value_to_string(&b.value), b.count))
                .collect::<FacetCounts>();
            facets.push((field, counts));
        }
        Ok(facets)
    }

    fn classify_upload(status: StatusCode, text: &str) -> RemoteStatus {
        match status {
            StatusCode::OK | StatusCode::CREATED => RemoteStatus::Ok,
            StatusCode::MULTI_STATUS => {
                let failed = serde_json::from_str::<IndexingResponseBody>(text)
                    .map(|body| {
                        body.value
                            .into_iter()
                            .filter(|r| !r.status)
                            .map(|r| {
                                format!("{}: {}", r.key, r.error_message.unwrap_or_default())
                            })
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                    .unwrap_or_else(|_| text.to_string());
                RemoteStatus::BatchPartialFailure(failed)
            }
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                RemoteStatus::TransientError(format!("{}: {}", s, text))
            }
            s => RemoteStatus::Error(format!("{}: {}", s, text)),
        }
    }
}

#[async_trait]
impl SearchBackend for AzureSearchBackend {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<RemoteStatus> {
        let body = Self::index_definition_body(definition);
        debug!("Create index request for '{}': {}", definition.name, body);

        let response = self.build_request(Method::POST, "/indexes").json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        let outcome = match status {
            StatusCode::CREATED => RemoteStatus::Created,
            StatusCode::OK | StatusCode::NO_CONTENT => RemoteStatus::Ok,
            StatusCode::CONFLICT => RemoteStatus::AlreadyExists,
            s => {
                error!("Failed to create index '{}' (Status: {}): {}", definition.name, s, text);
                RemoteStatus::Error(format!("{}: {}", s, text))
            }
        };
        Ok(outcome)
    }

    async fn delete_index(&self, name: &str) -> Result<RemoteStatus> {
        let response = self.build_request(Method::DELETE, &format!("/indexes/{}", name)).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(RemoteStatus::Ok);
        }
        let text = response.text().await.unwrap_or_default();
        Ok(RemoteStatus::Error(format!("{}: {}", status, text)))
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self.build_request(Method::GET, &format!("/indexes/{}", name)).send().await?;
        let status = response.status();
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => {
                let text = response.text().await.unwrap_or_default();
                error!("Failed to look up index '{}' (Status: {}): {}", name, s, text);
                Err(SearchError::Query(format!("index lookup for '{}' failed: {}: {}", name, s, text)))
            }
        }
    }

    async fn upload_documents(&self, index: &str, documents: &[Document]) -> Result<RemoteStatus> {
        let actions: Vec<Value> = documents
            .iter()
            .map(|doc| {
                let mut action = Map::with_capacity(doc.len() + 1);
                action.insert("@search.action".to_string(), Value::from(UPLOAD_ACTION));
                action.extend(doc.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(action)
            })
            .collect();
        let body = json!({ "value": actions });
        debug!("Uploading {} documents to index '{}'", documents.len(), index);

        let request = self.build_request(Method::POST, &format!("/indexes/{}/docs/index", index)).json(&body);

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!("Transport failure uploading to '{}': {}", index, e);
                return Ok(RemoteStatus::TransientError(e.to_string()));
            }
            Err(e) => {
                return Err(e.into());
            }
        };
        let status = response.status();
        let text = response.text().await?;

        let outcome = Self::classify_upload(status, &text);
        if !outcome.is_success() {
            error!("Upload to index '{}' not accepted (Status: {}): {}", index, status, text);
        }
        Ok(outcome)
    }

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<RawSearchResponse> {
        debug!("Search request to index '{}': {:?}", index, request);

        let response = self
            .build_request(Method::POST, &format!("/indexes/{}/docs/search", index))
            .json(request)
            .send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!("Search on index '{}' failed (Status: {}): {}", index, status, text);
            return Err(SearchError::Query(format!("{}: {}", status, text)));
        }

        let body: SearchResponseBody = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to parse search response: {}. Text: {}", e, text);
                return Err(e.into());
            }
        };

        let facets = match body.facets {
            Some(raw) => Self::parse_facets(raw)?,
            None => Vec::new(),
        };
        let documents: Vec<Document> = body.value.into_iter().map(Self::clean_document).collect();

        debug!("Parsed {} documents and {} facets from search on '{}'", documents.len(), facets.len(), index);
        Ok(RawSearchResponse {
            documents,
            facets,
            total_count: body.count,
        })
    }

    async fn suggest(&self, index: &str, request: &SuggestRequest) -> Result<Vec<Document>> {
        debug!("Suggest request to index '{}': {:?}", index, request);

        let response = self
            .build_request(Method::POST, &format!("/indexes/{}/docs/suggest", index))
            .json(request)
            .send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!("Suggest on index '{}' failed (Status: {}): {}", index, status, text);
            return Err(SearchError::Query(format!("{}: {}", status, text)));
        }

        let body: SuggestResponseBody = serde_json::from_str(&text)?;
        Ok(body.value.into_iter().map(Self::clean_document).collect())
    }
}
