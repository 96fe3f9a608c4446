//! Index lifecycle, indexing pipeline, query and suggest behaviour against
//! the in-memory backend.

mod common;

use common::*;
use futures::future::join_all;
use search_nexus::db::memory::InMemorySearchBackend;
use search_nexus::{
    FacetCounts,
    FieldSchema,
    QueryRequest,
    RemoteStatus,
    SearchBackend,
    SearchError,
    SearchIndexClient,
    SuggestRequest,
};
use serde_json::json;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };

fn flaky_client(backend: &Arc<FlakyBackend>) -> SearchIndexClient {
    SearchIndexClient::with_backend(
        test_config(),
        Arc::clone(backend) as Arc<dyn SearchBackend>
    ).unwrap()
}

#[tokio::test]
async fn test_create_index_then_exists() {
    let client = memory_client();
    assert!(!client.index_exists("products").await.unwrap());

    let created = client.create_index(&product_index("products"), Duration::ZERO).await.unwrap();
    assert!(created);
    assert!(client.index_exists("products").await.unwrap());
}

#[tokio::test]
async fn test_create_existing_index_is_ok() {
    let client = memory_client();
    create_products_index(&client, "products").await.unwrap();
    assert!(client.create_index(&product_index("products"), Duration::ZERO).await.unwrap());
}

#[tokio::test]
async fn test_create_index_waits_for_creation_delay() {
    let client = memory_client();
    let started = Instant::now();
    client.create_index(&product_index("products"), Duration::from_millis(50)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_create_index_rejects_invalid_schema() {
    let client = memory_client();
    let mut definition = product_index("products");
    definition.fields[0].is_key = false;

    let err = client.create_index(&definition, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, SearchError::Configuration(_)));
    assert!(!client.index_exists("products").await.unwrap());
}

#[tokio::test]
async fn test_delete_index() {
    let client = memory_client();
    create_products_index(&client, "products").await.unwrap();

    assert!(client.delete_index("products").await);
    assert!(!client.index_exists("products").await.unwrap());
    // a second delete fails quietly
    assert!(!client.delete_index("products").await);
}

#[tokio::test]
async fn test_missing_index_hook_runs_once_before_upload() {
    let backend = Arc::new(FlakyBackend::new(0, RemoteStatus::Ok));
    let client = flaky_client(&backend);
    let hook_calls = AtomicUsize::new(0);

    let indexed = client
        .index_items("products", &products(), |name| {
            let client = &client;
            let hook_calls = &hook_calls;
            let backend = &backend;
            async move {
                hook_calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(backend.upload_count(), 0);
                create_products_index(client, &name).await
            }
        }).await
        .unwrap();

    assert!(indexed);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.upload_count(), 1);
}

#[tokio::test]
async fn test_hook_not_called_for_existing_index() {
    let client = memory_client();
    create_products_index(&client, "products").await.unwrap();
    let hook_calls = AtomicUsize::new(0);

    client
        .index_items("products", &products(), |name| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            no_hook(name)
        }).await
        .unwrap();

    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_index_still_missing_after_hook() {
    let client = memory_client();
    let err = client
        .index_items("products", &products(), no_hook).await
        .unwrap_err();
    assert!(matches!(err, SearchError::IndexNotFound(name) if name == "products"));
}

#[tokio::test]
async fn test_hook_error_propagates() {
    let client = memory_client();
    let err = client
        .index_items("products", &products(), |name| async move {
            Err::<(), _>(SearchError::IndexCreation(format!("no quota for {}", name)))
        }).await
        .unwrap_err();
    assert!(matches!(err, SearchError::IndexCreation(_)));
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_identical_batch() {
    for failure in [
        RemoteStatus::BatchPartialFailure("2: throttled".into()),
        RemoteStatus::TransientError("503".into()),
    ] {
        let backend = Arc::new(FlakyBackend::new(3, failure));
        let client = flaky_client(&backend);
        create_products_index(&client, "products").await.unwrap();

        let indexed = client
            .index_items_with_retries("products", &products(), no_hook, 10).await
            .unwrap();

        assert!(indexed);
        let uploads = backend.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 4);
        assert!(uploads.iter().all(|batch| batch == &uploads[0]));
        assert_eq!(uploads[0].len(), 8);
        assert_eq!(backend.inner.document_count("products"), Some(8));
    }
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let backend = Arc::new(FlakyBackend::new(100, RemoteStatus::TransientError("503".into())));
    let client = flaky_client(&backend);
    create_products_index(&client, "products").await.unwrap();

    let err = client
        .index_items_with_retries("products", &products(), no_hook, 3).await
        .unwrap_err();

    assert!(matches!(err, SearchError::RetryBudgetExhausted { attempts: 4, .. }));
    assert_eq!(backend.upload_count(), 4);
}

#[tokio::test]
async fn test_non_transient_failure_is_not_retried() {
    let backend = Arc::new(FlakyBackend::new(5, RemoteStatus::Error("400: bad field".into())));
    let client = flaky_client(&backend);
    create_products_index(&client, "products").await.unwrap();

    let err = client.index_items("products", &products(), no_hook).await.unwrap_err();

    assert!(matches!(err, SearchError::Indexing(detail) if detail.contains("bad field")));
    assert_eq!(backend.upload_count(), 1);
}

#[tokio::test]
async fn test_reindex_overwrites_by_key() {
    let client = populated_client("products").await;

    let updated: Vec<Product> = products()
        .into_iter()
        .map(|p| Product { brand: format!("Updated{}", p.brand), ..p })
        .collect();
    client.index_items("products", &updated, no_hook).await.unwrap();

    let result = client
        .query::<Product>("products", &QueryRequest::match_all().include_total_count(true)).await
        .unwrap();
    assert_eq!(result.total_count, Some(8));
    assert!(result.documents.iter().all(|p| p.brand.starts_with("Updated")));
}

#[tokio::test]
async fn test_hidden_fields_are_filterable_but_not_returned() {
    let client = memory_client();
    let mut definition = product_index("template").renamed("catalog");
    definition.fields.push(FieldSchema::text("Supplier").filterable().hidden());
    client.create_index(&definition, Duration::ZERO).await.unwrap();
    assert!(client.index_exists("catalog").await.unwrap());
    assert!(!client.index_exists("template").await.unwrap());

    let mut item = serde_json::to_value(&products()[0]).unwrap();
    item["Supplier"] = json!("Acme");
    client.index_items("catalog", &[item], no_hook).await.unwrap();

    let result = client
        .query::<serde_json::Value>(
            "catalog",
            &QueryRequest::match_all().filter("Supplier eq 'Acme'")
        ).await
        .unwrap();
    assert_eq!(result.documents.len(), 1);
    assert!(result.documents[0].get("Supplier").is_none());
    assert_eq!(result.documents[0]["ProductName"], "Coke Classic");
}

#[tokio::test]
async fn test_search_text() {
    let client = populated_client("products").await;

    let found = client
        .search(
            "products",
            &QueryRequest::new("Yellow").include_total_count(false).top(50).skip(0),
            |p: Product| p,
            |_, _| panic!("no facets requested"),
            |count| assert_eq!(count, None)
        ).await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert!(found[0].product_name.contains("Yellow"));
}

#[tokio::test]
async fn test_projection_reshapes_results() {
    let client = populated_client("products").await;

    let names = client
        .search(
            "products",
            &QueryRequest::new("Pepsi"),
            |p: Product| p.product_name,
            |_, _| {},
            |_| {}
        ).await
        .unwrap();

    assert_eq!(names, vec!["Pepsi", "Diet Pepsi", "Pepsi Clear"]);
}

#[tokio::test]
async fn test_facet_counts() {
    let client = populated_client("products").await;
    let mut facets: Vec<(String, FacetCounts)> = Vec::new();

    client
        .search(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).top(50),
            |p: Product| p,
            |field, counts| facets.push((field.to_string(), counts)),
            |_| {}
        ).await
        .unwrap();

    assert_eq!(facets.len(), 1);
    let (field, counts) = &facets[0];
    assert_eq!(field, "Brand");
    assert_eq!(counts.len(), 3);
    assert_eq!(counts["Coke"], 4);
    assert_eq!(counts["Pepsi"], 3);
    assert_eq!(counts["NeHi"], 1);
    let order: Vec<&str> = counts.keys().map(String::as_str).collect();
    assert_eq!(order, vec!["Coke", "Pepsi", "NeHi"]);
}

#[tokio::test]
async fn test_filter_restricts_documents_and_facets() {
    let client = populated_client("products").await;

    let result = client
        .query::<Product>(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).filter("Brand eq 'Pepsi'")
        ).await
        .unwrap();
    assert_eq!(result.documents.len(), 3);
    assert!(result.documents.iter().all(|p| p.brand == "Pepsi"));
    let brands = result.facet("Brand").unwrap();
    assert_eq!(brands.len(), 1);
    assert_eq!(brands["Pepsi"], 3);

    let result = client
        .query::<Product>(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).filter("Brand eq 'Pepsi' and Cost ge 200")
        ).await
        .unwrap();
    assert_eq!(result.facet("Brand").unwrap()["Pepsi"], 2);
    assert!(result.documents.iter().any(|p| p.product_name == "Diet Pepsi"));
}

#[tokio::test]
async fn test_paging_reports_total_count() {
    let client = populated_client("products").await;
    let mut total = None;

    let first = client
        .search(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).include_total_count(true).top(5).skip(0),
            |p: Product| p,
            |_, _| {},
            |count| total = count
        ).await
        .unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(total, Some(8));

    total = None;
    let rest = client
        .search(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).include_total_count(true).top(5).skip(5),
            |p: Product| p,
            |_, _| {},
            |count| total = count
        ).await
        .unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(total, Some(8));

    let keys: Vec<_> = first.iter().chain(rest.iter()).map(|p| p.row_key.as_str()).collect();
    assert_eq!(keys, vec!["1", "2", "3", "4", "5", "6", "7", "8"]);
}

#[tokio::test]
async fn test_count_callback_runs_exactly_once() {
    let client = populated_client("products").await;

    for request in [
        QueryRequest::match_all(),
        QueryRequest::match_all().include_total_count(false),
        QueryRequest::match_all().include_total_count(true),
    ] {
        let mut calls = 0;
        let mut reported = None;
        client
            .search(
                "products",
                &request,
                |p: Product| p,
                |_, _| {},
                |count| {
                    calls += 1;
                    reported = count;
                }
            ).await
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(reported.is_some(), request.include_total_count == Some(true));
    }
}

#[tokio::test]
async fn test_metadata_only_query() {
    let client = populated_client("products").await;

    let result = client
        .query::<Product>(
            "products",
            &QueryRequest::match_all().facets(["Brand"]).include_total_count(true).top(0)
        ).await
        .unwrap();
    assert!(result.documents.is_empty());
    assert_eq!(result.total_count, Some(8));
    assert_eq!(result.facet("Brand").unwrap()["Coke"], 4);
}

#[tokio::test]
async fn test_search_unknown_index_fails() {
    let client = memory_client();
    let err = client.query::<Product>("nope", &QueryRequest::match_all()).await.unwrap_err();
    assert!(matches!(err, SearchError::Query(_)));
}

#[tokio::test]
async fn test_suggest() {
    let client = populated_client("products").await;

    let results = client
        .suggest(
            "products",
            &SuggestRequest::new(SUGGESTER_NAME, "Coke", 8).fuzzy(true),
            |s: ProductSuggest| s
        ).await
        .unwrap();

    assert_eq!(results.len(), 2);
    let names: Vec<_> = results.iter().map(|s| s.product_name.as_str()).collect();
    assert_eq!(names, vec!["Coke Classic", "Diet Coke"]);
}

#[tokio::test]
async fn test_suggest_with_filter_and_unknown_suggester() {
    let client = populated_client("products").await;

    let results = client
        .suggest(
            "products",
            &SuggestRequest::new(SUGGESTER_NAME, "Diet", 8).filter("Brand eq 'Pepsi'"),
            |s: ProductSuggest| s.row_key
        ).await
        .unwrap();
    assert_eq!(results, vec!["6"]);

    let err = client
        .suggest("products", &SuggestRequest::new("other", "Diet", 5), |s: ProductSuggest| s).await
        .unwrap_err();
    assert!(matches!(err, SearchError::Query(_)));
}

#[tokio::test]
async fn test_concurrent_per_item_indexing() {
    let backend = Arc::new(InMemorySearchBackend::new());
    let client = SearchIndexClient::with_backend(
        test_config(),
        Arc::clone(&backend) as Arc<dyn SearchBackend>
    ).unwrap();
    create_products_index(&client, "products").await.unwrap();

    let items = products();
    let tasks = items.iter().map(|item| {
        let client = &client;
        async move {
            client.index_items("products", std::slice::from_ref(item), no_hook).await
        }
    });
    let results = join_all(tasks).await;

    assert!(results.into_iter().all(|r| r.unwrap()));
    assert_eq!(backend.document_count("products"), Some(8));
}
