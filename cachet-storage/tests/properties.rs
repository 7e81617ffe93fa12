//! Property tests over the local backend.

use std::sync::Arc;

use cachet_storage::{CacheProvider, ExpiringMap, LocalCacheProvider};
use cachet_test_utils::fixtures::{local_provider, sample_table};
use cachet_test_utils::generators::{arb_gadget, arb_keys, arb_table, arb_widget};
use cachet_test_utils::{Expiry, Gadget, KeyNamespace, Table, Widget};
use proptest::prelude::*;

fn refs(keys: &[String]) -> Vec<&str> {
    keys.iter().map(String::as_str).collect()
}

#[test]
fn table_with_null_cells_survives_the_cache() {
    let provider = local_provider();
    let table = sample_table();

    provider.store(&table, Expiry::Default, &["report"]).unwrap();
    assert_eq!(provider.fetch::<Table>(&["report"]).unwrap(), Some(table));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_store_then_fetch_returns_value(widget in arb_widget(), keys in arb_keys()) {
        let provider = local_provider();
        let keys = refs(&keys);

        provider.store(&widget, Expiry::Default, &keys).unwrap();
        prop_assert_eq!(provider.fetch::<Widget>(&keys).unwrap(), Some(widget));
    }

    #[test]
    fn prop_tables_survive_the_cache(table in arb_table(), keys in arb_keys()) {
        let provider = local_provider();
        let keys = refs(&keys);

        provider.store(&table, Expiry::Default, &keys).unwrap();
        prop_assert_eq!(provider.fetch::<Table>(&keys).unwrap(), Some(table));
    }

    #[test]
    fn prop_invalidate_twice_is_noop(widget in arb_widget(), keys in arb_keys()) {
        let provider = local_provider();
        let keys = refs(&keys);
        provider.store(&widget, Expiry::Default, &keys).unwrap();

        let first = provider.invalidate::<Widget>(&keys).unwrap();
        let second = provider.invalidate::<Widget>(&keys).unwrap();

        prop_assert!(first >= 2);
        prop_assert_eq!(second, 0);
        prop_assert_eq!(provider.fetch::<Widget>(&keys).unwrap(), None);
    }

    #[test]
    fn prop_type_invalidation_spares_other_types(
        widget in arb_widget(),
        gadget in arb_gadget(),
        keys in arb_keys(),
    ) {
        let provider = local_provider();
        let keys = refs(&keys);
        provider.store(&widget, Expiry::Default, &keys).unwrap();
        provider.store(&gadget, Expiry::Default, &keys).unwrap();

        prop_assert_eq!(provider.invalidate_by_type::<Widget>().unwrap(), 2);
        prop_assert_eq!(provider.fetch::<Gadget>(&keys).unwrap(), Some(gadget));
    }

    #[test]
    fn prop_unconfigured_provider_never_stores(widget in arb_widget(), keys in arb_keys()) {
        let map = Arc::new(ExpiringMap::new());
        let mut provider = LocalCacheProvider::new(Arc::clone(&map));
        provider.configure(KeyNamespace::unset());
        let keys = refs(&keys);

        provider.store(&widget, Expiry::Default, &keys).unwrap();
        prop_assert!(map.is_empty());
        prop_assert_eq!(provider.fetch::<Widget>(&keys).unwrap(), None);
    }
}
