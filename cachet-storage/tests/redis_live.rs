//! Scenarios against a live Redis server.
//!
//! Ignored by default. Run with a disposable server:
//!
//! ```text
//! CACHET_TEST_REDIS_URL=redis://127.0.0.1:6379/ cargo test -p cachet-storage -- --ignored
//! ```
//!
//! Every test works in a fresh namespace, so runs do not see each other.

use std::sync::Arc;
use std::time::Duration;

use cachet_storage::{
    AsyncCacheProvider, CacheProvider, ConnectionRegistry, DistributedCacheProvider,
};
use cachet_test_utils::fixtures::{gadget, unique_namespace, widget, widget_page};
use cachet_test_utils::{init_tracing, Expiry, Gadget, Page, Widget};
use chrono::{TimeDelta, Utc};

const REDIS_URL_VAR: &str = "CACHET_TEST_REDIS_URL";

/// Database used by the live tests.
const TEST_DATABASE: i64 = 15;

fn redis_url() -> Option<String> {
    match std::env::var(REDIS_URL_VAR) {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("{REDIS_URL_VAR} not set; skipping live Redis test");
            None
        }
    }
}

fn live_provider(url: &str) -> DistributedCacheProvider {
    init_tracing();
    let mut provider = DistributedCacheProvider::new(Arc::new(ConnectionRegistry::new()));
    provider.configure(unique_namespace());
    provider.configure_target(url, TEST_DATABASE);
    assert!(provider.is_available(), "Redis at {url} is not reachable");
    provider
}

#[test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
fn redis_store_then_fetch() {
    let Some(url) = redis_url() else { return };
    let provider = live_provider(&url);

    provider
        .store(&42i64, Expiry::After(Duration::from_secs(60)), &["userId:7"])
        .unwrap();

    assert_eq!(provider.fetch::<i64>(&["userId:7"]).unwrap(), Some(42));
    let envelope = provider
        .fetch_metadata::<i64>(&["userId:7"])
        .unwrap()
        .unwrap();
    assert!(envelope.expires_on > envelope.cached_on);
    assert_eq!(provider.fetch::<i64>(&["userId:8"]).unwrap(), None);
}

#[test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
fn redis_invalidate_by_type_spares_other_types() {
    let Some(url) = redis_url() else { return };
    let provider = live_provider(&url);

    provider.store(&widget(1), Expiry::Default, &["1"]).unwrap();
    provider
        .store(&vec![widget(2), widget(3)], Expiry::Default, &["list"])
        .unwrap();
    provider
        .store(&widget_page(1, &[4, 5]), Expiry::Default, &["page", "1"])
        .unwrap();
    provider.store(&gadget(1), Expiry::Default, &["1"]).unwrap();

    assert_eq!(provider.invalidate_by_type::<Widget>().unwrap(), 6);

    assert_eq!(provider.fetch::<Widget>(&["1"]).unwrap(), None);
    assert_eq!(provider.fetch::<Vec<Widget>>(&["list"]).unwrap(), None);
    assert_eq!(provider.fetch::<Page<Widget>>(&["page", "1"]).unwrap(), None);
    assert_eq!(provider.fetch::<Gadget>(&["1"]).unwrap(), Some(gadget(1)));
}

#[test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
fn redis_past_absolute_expiry_is_absent() {
    let Some(url) = redis_url() else { return };
    let provider = live_provider(&url);

    provider.store(&widget(1), Expiry::Default, &["1"]).unwrap();
    provider
        .store(
            &widget(2),
            Expiry::At(Utc::now() - TimeDelta::seconds(1)),
            &["1"],
        )
        .unwrap();

    // The expired write also clears what was there before.
    assert_eq!(provider.fetch::<Widget>(&["1"]).unwrap(), None);
    assert_eq!(provider.fetch_metadata::<Widget>(&["1"]).unwrap(), None);
}

#[test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
fn redis_invalidate_twice_removes_nothing_the_second_time() {
    let Some(url) = redis_url() else { return };
    let provider = live_provider(&url);

    provider.store(&widget(1), Expiry::Default, &["user", "1"]).unwrap();
    provider.store(&widget(2), Expiry::Default, &["user", "2"]).unwrap();
    provider.store(&widget(3), Expiry::Default, &["users"]).unwrap();

    assert_eq!(provider.invalidate::<Widget>(&["user"]).unwrap(), 4);
    assert_eq!(provider.invalidate::<Widget>(&["user"]).unwrap(), 0);
    assert_eq!(provider.fetch::<Widget>(&["users"]).unwrap(), Some(widget(3)));
}

#[test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
fn redis_invalidation_spans_many_scan_batches() {
    let Some(url) = redis_url() else { return };
    let provider = live_provider(&url);

    for id in 0..1200u32 {
        let key = id.to_string();
        provider.store(&widget(id), Expiry::Default, &[key.as_str()]).unwrap();
    }

    assert_eq!(provider.invalidate_by_type::<Widget>().unwrap(), 2400);
    assert_eq!(provider.fetch::<Widget>(&["1199"]).unwrap(), None);
}

#[tokio::test]
#[ignore = "needs a Redis server at CACHET_TEST_REDIS_URL"]
async fn redis_async_forms_match_sync() {
    let Some(url) = redis_url() else { return };
    init_tracing();
    let mut provider = DistributedCacheProvider::new(Arc::new(ConnectionRegistry::new()));
    provider.configure(unique_namespace());
    provider.configure_target_async(&url, TEST_DATABASE).await;
    assert!(provider.is_available());

    provider
        .store_async(&widget(7), Expiry::Default, &["7"])
        .await
        .unwrap();
    assert_eq!(
        provider.fetch_async::<Widget>(&["7"]).await.unwrap(),
        Some(widget(7))
    );
    assert!(provider
        .fetch_metadata_async::<Widget>(&["7"])
        .await
        .unwrap()
        .is_some());

    assert_eq!(provider.invalidate_async::<Widget>(&["7"]).await.unwrap(), 2);
    assert_eq!(provider.invalidate_async::<Widget>(&["7"]).await.unwrap(), 0);

    provider
        .store_async(
            &widget(8),
            Expiry::At(Utc::now() - TimeDelta::seconds(1)),
            &["8"],
        )
        .await
        .unwrap();
    assert_eq!(provider.fetch_async::<Widget>(&["8"]).await.unwrap(), None);
}
