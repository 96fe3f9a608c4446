#![allow(dead_code)]

use async_trait::async_trait;
use search_nexus::db::memory::InMemorySearchBackend;
use search_nexus::db::{ Document, QueryRequest, RawSearchResponse, RemoteStatus, SearchBackend, SuggestRequest };
use search_nexus::{ FieldSchema, IndexDefinition, Result, SearchIndexClient, SearchServiceConfig, SuggesterDefinition };
use serde::{ Deserialize, Serialize };
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use std::time::Duration;

pub const SUGGESTER_NAME: &str = "sg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Product {
    pub row_key: String,
    pub brand: String,
    pub product_name: String,
    pub sku: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductSuggest {
    pub row_key: String,
    pub product_name: String,
}

pub fn product_index(name: &str) -> IndexDefinition {
    IndexDefinition::new(
        name,
        vec![
            FieldSchema::text("RowKey").key(),
            FieldSchema::text("Brand").searchable().filterable().sortable().facetable(),
            FieldSchema::text("ProductName").searchable().filterable().sortable(),
            FieldSchema::text("Sku").searchable().filterable().sortable(),
            FieldSchema::number("Cost").filterable().sortable().facetable()
        ]
    ).with_suggester(SuggesterDefinition::new(SUGGESTER_NAME, ["RowKey", "ProductName"]))
}

fn product(key: &str, brand: &str, name: &str, sku: &str, cost: f64) -> Product {
    Product {
        row_key: key.to_string(),
        brand: brand.to_string(),
        product_name: name.to_string(),
        sku: sku.to_string(),
        cost,
    }
}

/// Brand distribution: Coke 4, Pepsi 3, NeHi 1.
pub fn products() -> Vec<Product> {
    vec![
        product("1", "Coke", "Coke Classic", "123456", 100.0),
        product("2", "Coke", "Sprite", "123457", 100.0),
        product("3", "Coke", "Diet Coke", "123458", 201.0),
        product("4", "Coke", "Mello Yellow", "123459", 100.0),
        product("5", "Pepsi", "Pepsi", "223450", 200.0),
        product("6", "Pepsi", "Diet Pepsi", "223451", 210.0),
        product("7", "Pepsi", "Pepsi Clear", "223452", 190.0),
        product("8", "NeHi", "Grape", "323450", 300.0)
    ]
}

pub fn test_config() -> SearchServiceConfig {
    SearchServiceConfig::new("http://localhost:1", "test-key").unwrap()
}

pub fn memory_client() -> SearchIndexClient {
    SearchIndexClient::with_backend(test_config(), Arc::new(InMemorySearchBackend::new())).unwrap()
}

pub async fn create_products_index(client: &SearchIndexClient, name: &str) -> Result<()> {
    client.create_index(&product_index(name), Duration::ZERO).await.map(|_| ())
}

/// Missing-index hook that does nothing.
pub async fn no_hook(_index_name: String) -> Result<()> {
    Ok(())
}

/// Client with the products index created and populated.
pub async fn populated_client(index: &str) -> SearchIndexClient {
    let client = memory_client();
    create_products_index(&client, index).await.unwrap();
    let indexed = client
        .index_items(index, &products(), |name| {
            let client = &client;
            async move { create_products_index(client, &name).await }
        }).await
        .unwrap();
    assert!(indexed);
    client
}

/// Fails the first `failures` uploads with `failure`, then delegates.
pub struct FlakyBackend {
    pub inner: InMemorySearchBackend,
    failures_left: AtomicUsize,
    failure: RemoteStatus,
    pub uploads: Mutex<Vec<Vec<Document>>>,
}

impl FlakyBackend {
    pub fn new(failures: usize, failure: RemoteStatus) -> Self {
        Self {
            inner: InMemorySearchBackend::new(),
            failures_left: AtomicUsize::new(failures),
            failure,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl SearchBackend for FlakyBackend {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<RemoteStatus> {
        self.inner.create_index(definition).await
    }

    async fn delete_index(&self, name: &str) -> Result<RemoteStatus> {
        self.inner.delete_index(name).await
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        self.inner.index_exists(name).await
    }

    async fn upload_documents(&self, index: &str, documents: &[Document]) -> Result<RemoteStatus> {
        self.uploads.lock().unwrap().push(documents.to_vec());
        let failing = self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(self.failure.clone());
        }
        self.inner.upload_documents(index, documents).await
    }

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<RawSearchResponse> {
        self.inner.search(index, request).await
    }

    async fn suggest(&self, index: &str, request: &SuggestRequest) -> Result<Vec<Document>> {
        self.inner.suggest(index, request).await
    }
}
