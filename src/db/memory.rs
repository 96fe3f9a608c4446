//! In-process backend with the same observable contract as the hosted service.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{ PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard };
use log::{ debug, info };

use super::filter::Filter;
use super::{
    Document,
    FacetCounts,
    QueryRequest,
    RawSearchResponse,
    RemoteStatus,
    SearchBackend,
    SuggestRequest,
};
use crate::error::{ Result, SearchError };
use crate::schema::IndexDefinition;

const DEFAULT_TOP: usize = 50;

struct MemoryIndex {
    definition: IndexDefinition,
    documents: Vec<Document>,
    positions: HashMap<String, usize>,
}

impl MemoryIndex {
    fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            documents: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn retrievable(&self, doc: &Document) -> Document {
        let mut out = doc.clone();
        out.retain(|name, _| {
            self.definition.field(name).map_or(false, |f| f.is_retrievable)
        });
        out
    }

    fn matching(&self, search_text: &str, filter: Option<&Filter>) -> Vec<&Document> {
        let terms = search_terms(search_text);
        let searchable: Vec<&str> = self.definition.fields
            .iter()
            .filter(|f| f.is_searchable)
            .map(|f| f.name.as_str())
            .collect();

        self.documents
            .iter()
            .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
            .filter(|doc| terms.is_empty() || text_matches(doc, &searchable, &terms))
            .collect()
    }
}

#[derive(Default)]
pub struct InMemorySearchBackend {
    indexes: RwLock<HashMap<String, MemoryIndex>>,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        info!("Initializing in-memory search backend");
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MemoryIndex>> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MemoryIndex>> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored documents, if the index exists.
    pub fn document_count(&self, index: &str) -> Option<usize> {
        self.read()
            .get(index)
            .map(|i| i.documents.len())
    }
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<RemoteStatus> {
        let mut indexes = self.write();
        if indexes.contains_key(&definition.name) {
            return Ok(RemoteStatus::AlreadyExists);
        }
        indexes.insert(definition.name.clone(), MemoryIndex::new(definition.clone()));
        debug!("Created in-memory index '{}'", definition.name);
        Ok(RemoteStatus::Created)
    }

    async fn delete_index(&self, name: &str) -> Result<RemoteStatus> {
        match self.write().remove(name) {
            Some(_) => Ok(RemoteStatus::Ok),
            None => Ok(RemoteStatus::Error(format!("index '{}' not found", name))),
        }
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read().contains_key(name))
    }

    async fn upload_documents(&self, index: &str, documents: &[Document]) -> Result<RemoteStatus> {
        let mut indexes = self.write();
        let Some(target) = indexes.get_mut(index) else {
            return Ok(RemoteStatus::Error(format!("index '{}' not found", index)));
        };
        let Some(key_field) = target.definition.key_field().map(|f| f.name.clone()) else {
            return Ok(RemoteStatus::Error(format!("index '{}' has no key field", index)));
        };

        // the whole batch is checked before anything is stored
        let mut keyed = Vec::with_capacity(documents.len());
        for doc in documents {
            if let Some(unknown) = doc.keys().find(|k| target.definition.field(k).is_none()) {
                return Ok(
                    RemoteStatus::Error(
                        format!("field '{}' is not part of index '{}'", unknown, index)
                    )
                );
            }
            match doc.get(&key_field) {
                Some(Value::Null) | None => {
                    return Ok(
                        RemoteStatus::Error(format!("document is missing key field '{}'", key_field))
                    );
                }
                Some(key) => keyed.push((value_to_string(key), doc.clone())),
            }
        }

        for (key, doc) in keyed {
            match target.positions.get(&key) {
                Some(&pos) => {
                    target.documents[pos] = doc;
                }
                None => {
                    target.positions.insert(key, target.documents.len());
                    target.documents.push(doc);
                }
            }
        }
        debug!("Stored {} documents in in-memory index '{}'", documents.len(), index);
        Ok(RemoteStatus::Ok)
    }

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<RawSearchResponse> {
        let indexes = self.read();
        let target = indexes
            .get(index)
            .ok_or_else(|| SearchError::Query(format!("index '{}' not found", index)))?;

        let filter = request.filter.as_deref().map(Filter::parse).transpose()?;
        let matched = target.matching(&request.search_text, filter.as_ref());

        let mut facets = Vec::new();
        for field in request.facet_fields.iter().flatten() {
            let facetable = target.definition.field(field).map_or(false, |f| f.is_facetable);
            if !facetable {
                return Err(SearchError::Query(format!("field '{}' is not facetable", field)));
            }
            let mut counts = FacetCounts::new();
            for doc in &matched {
                match doc.get(field) {
                    None | Some(Value::Null) => {}
                    Some(value) => {
                        *counts.entry(value_to_string(value)).or_insert(0) += 1;
                    }
                }
            }
            // the service returns buckets by descending count
            counts.sort_by(|value_a, count_a, value_b, count_b| {
                count_b.cmp(count_a).then_with(|| value_a.cmp(value_b))
            });
            facets.push((field.clone(), counts));
        }

        let total_count = match request.include_total_count {
            Some(true) => Some(matched.len() as i64),
            _ => None,
        };

        let documents = matched
            .into_iter()
            .skip(request.skip.unwrap_or(0))
            .take(request.top.unwrap_or(DEFAULT_TOP))
            .map(|doc| target.retrievable(doc))
            .collect();

        Ok(RawSearchResponse {
            documents,
            facets,
            total_count,
        })
    }

    async fn suggest(&self, index: &str, request: &SuggestRequest) -> Result<Vec<Document>> {
        let indexes = self.read();
        let target = indexes
            .get(index)
            .ok_or_else(|| SearchError::Query(format!("index '{}' not found", index)))?;
        let suggester = target.definition.suggester
            .as_ref()
            .filter(|s| s.name == request.suggester_name)
            .ok_or_else(|| {
                SearchError::Query(
                    format!("suggester '{}' not defined on index '{}'", request.suggester_name, index)
                )
            })?;

        let filter = request.filter.as_deref().map(Filter::parse).transpose()?;
        let needle = request.search_text.to_lowercase();

        Ok(
            target.documents
                .iter()
                .filter(|doc| filter.as_ref().map_or(true, |f| f.matches(doc)))
                .filter(|doc| {
                    suggester.source_field_names.iter().any(|field| {
                        doc.get(field)
                            .map(value_to_string)
                            .map_or(false, |text| suggest_matches(&text, &needle, request.fuzzy))
                    })
                })
                .take(request.top)
                .map(|doc| target.retrievable(doc))
                .collect()
        )
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Lowercased terms; empty for the match-all query.
fn search_terms(search_text: &str) -> Vec<String> {
    let trimmed = search_text.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Vec::new();
    }
    trimmed
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t != "*")
        .collect()
}

fn text_matches(doc: &Document, searchable: &[&str], terms: &[String]) -> bool {
    terms.iter().any(|term| {
        let (stem, prefix) = match term.strip_suffix('*') {
            Some(stem) => (stem, true),
            None => (term.as_str(), false),
        };
        searchable.iter().any(|field| {
            doc.get(*field)
                .map(value_to_string)
                .map_or(false, |text| {
                    words(&text).any(|w| if prefix { w.starts_with(stem) } else { w == stem })
                })
        })
    })
}

fn suggest_matches(text: &str, needle: &str, fuzzy: bool) -> bool {
    if needle.is_empty() {
        return false;
    }
    let needle_len = needle.chars().count();
    words(text).any(|word| {
        if word.starts_with(needle) {
            return true;
        }
        if !fuzzy {
            return false;
        }
        let head: String = word.chars().take(needle_len).collect();
        levenshtein(&head, needle) <= 1
    })
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}
