//! Test suite for ensuring a correct implementation of a document store.
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;

use super::*;

fn document(status: &str, created: DateTime<Utc>) -> serde_json::Value {
    json!({
        "status": status,
        "dateCreated": created.to_rfc3339_opts(SecondsFormat::Micros, true),
    })
}

fn statuses(results: &QueryResults<serde_json::Value>) -> Vec<&str> {
    results
        .results
        .iter()
        .filter_map(|item| item["status"].as_str())
        .collect()
}

/// Create test suite for jobflow document stores.
///
/// Store implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use jobflow::test_suite;
/// use jobflow::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you use a different async test attribute you can configure the macro to use that instead.
/// For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use jobflow::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: StoreImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn get_missing_document $args {
            let backend = $backend;
            $crate::store::testing::get_missing_document(backend).await;
        }
        #[$attr]
        async fn put_then_get $args {
            let backend = $backend;
            $crate::store::testing::put_then_get(backend).await;
        }
        #[$attr]
        async fn put_overwrites $args {
            let backend = $backend;
            $crate::store::testing::put_overwrites(backend).await;
        }
        #[$attr]
        async fn delete_document $args {
            let backend = $backend;
            $crate::store::testing::delete_document(backend).await;
        }
        #[$attr]
        async fn query_only_direct_children $args {
            let backend = $backend;
            $crate::store::testing::query_only_direct_children(backend).await;
        }
        #[$attr]
        async fn query_by_status $args {
            let backend = $backend;
            $crate::store::testing::query_by_status(backend).await;
        }
        #[$attr]
        async fn query_by_inclusive_date_range $args {
            let backend = $backend;
            $crate::store::testing::query_by_inclusive_date_range(backend).await;
        }
        #[$attr]
        async fn query_sort_order $args {
            let backend = $backend;
            $crate::store::testing::query_sort_order(backend).await;
        }
        #[$attr]
        async fn query_pagination $args {
            let backend = $backend;
            $crate::store::testing::query_pagination(backend).await;
        }
        #[$attr]
        async fn query_invalid_page_token $args {
            let backend = $backend;
            $crate::store::testing::query_invalid_page_token(backend).await;
        }
        #[$attr]
        async fn mutex_try_lock $args {
            let backend = $backend;
            $crate::store::testing::mutex_try_lock(backend).await;
        }
        #[$attr]
        async fn mutex_names_are_independent $args {
            let backend = $backend;
            $crate::store::testing::mutex_names_are_independent(backend).await;
        }
        #[$attr]
        async fn mutex_lock_waits $args {
            let backend = $backend;
            $crate::store::testing::mutex_lock_waits(backend).await;
        }
    };
}

pub async fn get_missing_document(store: impl DocumentStore) {
    assert!(store.get("/jobs/missing").await.unwrap().is_none());
}

pub async fn put_then_get(store: impl DocumentStore) {
    let item = document("New", Utc::now());
    let stored = store.put("/jobs/1", item.clone()).await.unwrap();
    assert_eq!(stored, item);
    assert_eq!(store.get("/jobs/1").await.unwrap(), Some(item));
}

pub async fn put_overwrites(store: impl DocumentStore) {
    let created = Utc::now();
    store.put("/jobs/1", document("New", created)).await.unwrap();
    store
        .put("/jobs/1", document("Running", created))
        .await
        .unwrap();

    let item = store.get("/jobs/1").await.unwrap().unwrap();
    assert_eq!(item["status"], "Running");

    let results = store.query(DocumentQuery::new("/jobs")).await.unwrap();
    assert_eq!(results.results.len(), 1);
}

pub async fn delete_document(store: impl DocumentStore) {
    store
        .put("/jobs/1", document("New", Utc::now()))
        .await
        .unwrap();
    store.delete("/jobs/1").await.unwrap();
    assert!(store.get("/jobs/1").await.unwrap().is_none());

    // Deleting something that does not exist is fine.
    store.delete("/jobs/1").await.unwrap();
}

pub async fn query_only_direct_children(store: impl DocumentStore) {
    let now = Utc::now();
    store.put("/jobs/1", document("New", now)).await.unwrap();
    store
        .put("/jobs/1/executions/1", document("Pending", now))
        .await
        .unwrap();
    store.put("/other/1", document("New", now)).await.unwrap();

    let jobs = store.query(DocumentQuery::new("/jobs")).await.unwrap();
    assert_eq!(statuses(&jobs), ["New"]);

    let executions = store
        .query(DocumentQuery::new("/jobs/1/executions"))
        .await
        .unwrap();
    assert_eq!(statuses(&executions), ["Pending"]);
    assert!(executions.next_page_token.is_none());
}

pub async fn query_by_status(store: impl DocumentStore) {
    let now = Utc::now();
    store.put("/jobs/1", document("New", now)).await.unwrap();
    store.put("/jobs/2", document("Running", now)).await.unwrap();
    store.put("/jobs/3", document("Failed", now)).await.unwrap();

    let results = store
        .query(
            DocumentQuery::new("/jobs").with_filter(Filter::StatusEqual("Running".to_owned())),
        )
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Running"]);

    let results = store
        .query(DocumentQuery::new("/jobs").with_filter(Filter::Or(vec![
            Filter::StatusEqual("New".to_owned()),
            Filter::StatusEqual("Failed".to_owned()),
        ])))
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["New", "Failed"]);

    let results = store
        .query(
            DocumentQuery::new("/jobs").with_filter(Filter::Not(Box::new(Filter::StatusEqual(
                "New".to_owned(),
            )))),
        )
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Running", "Failed"]);
}

pub async fn query_by_inclusive_date_range(store: impl DocumentStore) {
    let now = Utc::now();
    let old = now - TimeDelta::days(3);
    let middle = now - TimeDelta::days(2);
    let recent = now - TimeDelta::days(1);
    store.put("/jobs/1", document("Old", old)).await.unwrap();
    store.put("/jobs/2", document("Middle", middle)).await.unwrap();
    store.put("/jobs/3", document("Recent", recent)).await.unwrap();

    let parse = |value: serde_json::Value| {
        DateTime::parse_from_rfc3339(value["dateCreated"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc)
    };
    let middle = parse(document("", middle));

    let results = store
        .query(DocumentQuery::new("/jobs").with_filter(Filter::CreatedTo(middle)))
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Old", "Middle"]);

    let results = store
        .query(DocumentQuery::new("/jobs").with_filter(Filter::CreatedFrom(middle)))
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Middle", "Recent"]);

    let results = store
        .query(DocumentQuery::new("/jobs").with_filter(Filter::And(vec![
            Filter::CreatedFrom(middle),
            Filter::CreatedTo(middle),
        ])))
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Middle"]);
}

pub async fn query_sort_order(store: impl DocumentStore) {
    let now = Utc::now();
    store
        .put("/jobs/b", document("Second", now - TimeDelta::minutes(1)))
        .await
        .unwrap();
    store
        .put("/jobs/a", document("First", now - TimeDelta::minutes(2)))
        .await
        .unwrap();
    store.put("/jobs/c", document("Third", now)).await.unwrap();

    let results = store.query(DocumentQuery::new("/jobs")).await.unwrap();
    assert_eq!(statuses(&results), ["First", "Second", "Third"]);

    let results = store
        .query(DocumentQuery::new("/jobs").sorted(SortOrder::Descending))
        .await
        .unwrap();
    assert_eq!(statuses(&results), ["Third", "Second", "First"]);
}

pub async fn query_pagination(store: impl DocumentStore) {
    let now = Utc::now();
    for idx in 0..5 {
        store
            .put(
                &format!("/jobs/{idx}"),
                document(&format!("S{idx}"), now + TimeDelta::seconds(idx)),
            )
            .await
            .unwrap();
    }
    // Ties on the creation time are broken by path.
    store.put("/jobs/5", document("S5", now)).await.unwrap();

    for order in [SortOrder::Ascending, SortOrder::Descending] {
        let mut seen = Vec::new();
        let mut page_token = None;
        let mut pages = 0;
        loop {
            let page = store
                .query(
                    DocumentQuery::new("/jobs")
                        .sorted(order)
                        .with_page_size(Some(2))
                        .starting_at(page_token),
                )
                .await
                .unwrap();
            pages += 1;
            assert!(page.results.len() <= 2);
            seen.extend(statuses(&page).into_iter().map(ToOwned::to_owned));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        assert_eq!(pages, 3);

        let mut expected = vec!["S0", "S5", "S1", "S2", "S3", "S4"];
        if order == SortOrder::Descending {
            expected.reverse();
        }
        assert_eq!(seen, expected);
    }
}

pub async fn query_invalid_page_token(store: impl DocumentStore) {
    let result = store
        .query(DocumentQuery::new("/jobs").starting_at(Some(PageToken::from("nope".to_owned()))))
        .await;
    assert!(matches!(result, Err(StoreError::InvalidPageToken(_))));
}

pub async fn mutex_try_lock(store: impl DocumentStore) {
    let first = store.create_mutex("/jobs/1", "first");
    let second = store.create_mutex("/jobs/1", "second");

    assert!(first.try_lock().await.unwrap());
    assert!(!second.try_lock().await.unwrap());

    first.unlock().await.unwrap();
    assert!(second.try_lock().await.unwrap());
    second.unlock().await.unwrap();
}

pub async fn mutex_names_are_independent(store: impl DocumentStore) {
    let first = store.create_mutex("/jobs/1", "request");
    let second = store.create_mutex("/jobs/2", "request");

    assert!(first.try_lock().await.unwrap());
    assert!(second.try_lock().await.unwrap());
    assert_eq!(first.name(), "/jobs/1");

    first.unlock().await.unwrap();
    second.unlock().await.unwrap();
}

pub async fn mutex_lock_waits(store: impl DocumentStore + Clone + 'static) {
    let first = store.create_mutex("checker", "first");
    first.lock().await.unwrap();

    let waiter = tokio::spawn({
        let store = store.clone();
        async move {
            let second = store.create_mutex("checker", "second");
            second.lock().await.unwrap();
            second.unlock().await.unwrap();
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    first.unlock().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("lock should be acquired once released")
        .unwrap();
}
