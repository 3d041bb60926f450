//! End-to-end behavior of the option and transient stores against the
//! in-memory table, the Moka cache and a manual clock.

use optstore::{
    Autoload, CacheConfig, Clock, CacheGroup, ManualClock, MemoryCache, MemoryTable, NOTOPTIONS_KEY,
    ObjectCache, OptionStore, OptionTable, ScanFilter, SettingArgs, WriteOutcome, codec,
};
use serde_json::{Value, json};
use std::sync::Arc;

struct Fixture {
    table: Arc<MemoryTable>,
    cache: Arc<MemoryCache>,
    clock: Arc<ManualClock>,
    store: OptionStore,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let table = Arc::new(MemoryTable::new());
    let cache = Arc::new(MemoryCache::with_clock(&CacheConfig::default(), clock.clone()));
    let store = OptionStore::new(table.clone(), cache.clone()).with_clock(clock.clone());
    Fixture {
        table,
        cache,
        clock,
        store,
    }
}

/// Decoded values of every autoloaded row, read straight from the table
async fn autoloaded_rows(table: &MemoryTable) -> Vec<(String, Value)> {
    table
        .scan(&ScanFilter::autoloaded())
        .await
        .unwrap()
        .into_iter()
        .map(|row| (row.name, codec::decode(&row.value)))
        .collect()
}

#[tokio::test]
async fn add_then_get_round_trips() {
    let fx = fixture();
    let values = [
        json!("plain"),
        json!("42"),
        json!(42),
        json!(1.5),
        json!(true),
        json!(null),
        json!(["a", {"b": [1, 2]}]),
        json!({"nested": {"deep": "value"}}),
        json!(""),
    ];
    for (i, value) in values.iter().enumerate() {
        let name = format!("opt_{i}");
        let autoload = if i % 2 == 0 { Autoload::Yes } else { Autoload::No };
        assert!(fx.store.add(&name, value.clone(), autoload).await.unwrap());
        assert_eq!(&fx.store.get(&name).await.unwrap(), value, "{name}");
    }

    // Also through a cold cache
    fx.cache.flush().await;
    for (i, value) in values.iter().enumerate() {
        assert_eq!(&fx.store.get(&format!("opt_{i}")).await.unwrap(), value);
    }
}

#[tokio::test]
async fn add_on_existing_leaves_value() {
    let fx = fixture();
    fx.store.add("site", json!("one"), Autoload::Yes).await.unwrap();
    assert!(!fx.store.add("site", json!("two"), Autoload::Yes).await.unwrap());
    assert_eq!(fx.store.get("site").await.unwrap(), json!("one"));
    let row = fx.table.get_row("site").await.unwrap().unwrap();
    assert_eq!(row.value, "one");
}

#[tokio::test]
async fn update_with_same_value_performs_no_write() {
    let fx = fixture();
    fx.store.add("count", json!(7), Autoload::Yes).await.unwrap();

    // Any write would fail now, so an attempted one would surface as Failed
    fx.table.fail_writes(true);
    assert_eq!(
        fx.store.update_outcome("count", json!(7), None).await.unwrap(),
        WriteOutcome::Unchanged
    );
    assert!(!fx.store.update("count", json!(7), None).await.unwrap());
}

#[tokio::test]
async fn update_on_missing_behaves_like_add_no() {
    let a = fixture();
    let b = fixture();

    assert!(a.store.update("fresh", json!({"k": 1}), None).await.unwrap());
    assert!(b.store.add("fresh", json!({"k": 1}), Autoload::No).await.unwrap());

    let row_a = a.table.get_row("fresh").await.unwrap().unwrap();
    let row_b = b.table.get_row("fresh").await.unwrap().unwrap();
    assert_eq!(row_a, row_b);
    assert_eq!(row_a.autoload, Autoload::No);
    assert_eq!(a.store.get("fresh").await.unwrap(), json!({"k": 1}));
}

#[tokio::test]
async fn delete_missing_then_default() {
    let fx = fixture();
    assert!(!fx.store.delete("ghost").await.unwrap());

    fx.store.add("ghost", json!("boo"), Autoload::No).await.unwrap();
    assert!(fx.store.delete("ghost").await.unwrap());
    assert_eq!(fx.store.get("ghost").await.unwrap(), json!(false));
    assert_eq!(
        fx.store.get_or("ghost", json!("explicit")).await.unwrap(),
        json!("explicit")
    );
}

#[tokio::test]
async fn negative_cache_does_not_go_stale() {
    let fx = fixture();
    assert_eq!(fx.store.get("later").await.unwrap(), json!(false));

    let notoptions = fx.cache.get(CacheGroup::Options, NOTOPTIONS_KEY).await.unwrap();
    assert_eq!(notoptions["later"], json!(true));

    assert!(fx.store.add("later", json!("now"), Autoload::No).await.unwrap());
    assert_eq!(fx.store.get("later").await.unwrap(), json!("now"));

    let notoptions = fx.cache.get(CacheGroup::Options, NOTOPTIONS_KEY).await.unwrap();
    assert!(notoptions.get("later").is_none());
}

#[tokio::test]
async fn negative_cache_skips_the_table() {
    let fx = fixture();
    fx.store.get("absent").await.unwrap();

    // A row written behind the store's back stays invisible until the
    // negative entry is cleared by a store write
    fx.table.upsert("absent", "sneaky", Autoload::No).await.unwrap();
    assert_eq!(fx.store.get("absent").await.unwrap(), json!(false));

    fx.cache.delete(CacheGroup::Options, NOTOPTIONS_KEY).await;
    assert_eq!(fx.store.get("absent").await.unwrap(), json!("sneaky"));
}

async fn assert_autoload_matches(fx: &Fixture) {
    for (name, value) in autoloaded_rows(&fx.table).await {
        assert_eq!(fx.store.get(&name).await.unwrap(), value, "{name}");
    }
}

#[tokio::test]
async fn autoloaded_values_track_the_table() {
    let fx = fixture();
    let store = &fx.store;

    store.add("a", json!(1), Autoload::Yes).await.unwrap();
    assert_autoload_matches(&fx).await;
    store.add("b", json!("two"), Autoload::Yes).await.unwrap();
    assert_autoload_matches(&fx).await;
    store.update("a", json!([1, 1]), None).await.unwrap();
    assert_autoload_matches(&fx).await;
    store.add("c", json!("off"), Autoload::No).await.unwrap();
    assert_autoload_matches(&fx).await;
    store.update("c", json!("on"), Some(Autoload::Yes)).await.unwrap();
    assert_autoload_matches(&fx).await;
    store.delete("b").await.unwrap();
    assert_autoload_matches(&fx).await;
    store.update("fresh", json!({"x": 0}), Some(Autoload::Yes)).await.unwrap();
    assert_autoload_matches(&fx).await;

    let autoloaded = store.autoloaded().await.unwrap();
    assert_eq!(autoloaded.get("a"), Some(&json!([1, 1])));
    assert!(!autoloaded.contains_key("b"));
}

#[tokio::test]
async fn autoload_flag_change_is_patched_in_place() {
    let fx = fixture();
    let store = &fx.store;
    store.add("flag", json!("v1"), Autoload::No).await.unwrap();
    assert!(!store.autoloaded().await.unwrap().contains_key("flag"));

    // The row becomes autoloaded, but the cached bulk map only learns about
    // it once it is rebuilt
    store.update("flag", json!("v2"), Some(Autoload::Yes)).await.unwrap();
    assert_eq!(
        fx.table.get_row("flag").await.unwrap().unwrap().autoload,
        Autoload::Yes
    );
    assert!(!store.autoloaded().await.unwrap().contains_key("flag"));
    assert_eq!(store.get("flag").await.unwrap(), json!("v2"));

    fx.cache.flush().await;
    assert_eq!(store.autoloaded().await.unwrap().get("flag"), Some(&json!("v2")));

    // Demoting a row leaves it in the cached map, still with the fresh value
    store.update("flag", json!("v3"), Some(Autoload::No)).await.unwrap();
    assert_eq!(store.autoloaded().await.unwrap().get("flag"), Some(&json!("v3")));
    assert_eq!(store.get("flag").await.unwrap(), json!("v3"));
}

#[tokio::test]
async fn registered_default_scenario() {
    let fx = fixture();
    let store = &fx.store;
    store
        .settings()
        .register("general", "color", SettingArgs::new().default(json!("blue")));

    assert_eq!(store.get("color").await.unwrap(), json!("blue"));
    assert!(store.add("color", json!("red"), Autoload::Yes).await.unwrap());
    assert_eq!(store.get("color").await.unwrap(), json!("red"));
    assert!(store.delete("color").await.unwrap());
    assert_eq!(store.get("color").await.unwrap(), json!("blue"));

    // An explicit default still wins over the registered one
    assert_eq!(store.get_or("color", json!("green")).await.unwrap(), json!("green"));

    store.settings().unregister("general", "color");
    assert_eq!(store.get("color").await.unwrap(), json!(false));
}

#[tokio::test]
async fn registered_sanitize_runs_on_every_write() {
    let fx = fixture();
    let store = &fx.store;
    store.settings().register(
        "general",
        "slug",
        SettingArgs::new()
            .sanitize(|_, value, _| json!(value.as_str().unwrap_or_default().to_lowercase()))
            .validate(|_, value, errors| {
                if !value.is_string() {
                    errors.add("not_a_string", "Slug must be text");
                }
            }),
    );

    store.add("slug", json!("Hello"), Autoload::Yes).await.unwrap();
    assert_eq!(store.get("slug").await.unwrap(), json!("hello"));

    store.update("slug", json!("WORLD"), None).await.unwrap();
    assert_eq!(store.get("slug").await.unwrap(), json!("world"));

    assert!(!store.update("slug", json!(12), None).await.unwrap());
    assert_eq!(store.get("slug").await.unwrap(), json!("world"));
    assert_eq!(store.settings_errors().get(Some("slug")).len(), 1);
}

#[tokio::test]
async fn transient_expiry_removes_both_records() {
    let fx = fixture();
    let transients = fx.store.transients();
    assert!(transients.set("blip", json!("v"), 1).await.unwrap());
    assert!(fx.table.get_row("_transient_blip").await.unwrap().is_some());
    assert!(fx.table.get_row("_transient_timeout_blip").await.unwrap().is_some());

    fx.clock.advance(2);
    assert_eq!(transients.get("blip").await.unwrap(), json!(false));
    assert!(fx.table.get_row("_transient_blip").await.unwrap().is_none());
    assert!(fx.table.get_row("_transient_timeout_blip").await.unwrap().is_none());
}

#[tokio::test]
async fn transient_gaining_expiry_is_not_left_autoloaded() {
    let fx = fixture();
    let transients = fx.store.transients();
    transients.set("cfg", json!("v1"), 0).await.unwrap();
    assert_eq!(
        fx.table.get_row("_transient_cfg").await.unwrap().unwrap().autoload,
        Autoload::Yes
    );

    transients.set("cfg", json!("v2"), 5).await.unwrap();
    let value = fx.table.get_row("_transient_cfg").await.unwrap().unwrap();
    assert_eq!(value.autoload, Autoload::No);
    assert_eq!(value.value, "v2");
    let timeout = fx
        .table
        .get_row("_transient_timeout_cfg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timeout.value, (fx.clock.now() + 5).to_string());
    assert!(!fx.store.autoloaded().await.unwrap().contains_key("_transient_cfg"));

    fx.clock.advance(6);
    assert_eq!(transients.get("cfg").await.unwrap(), json!(false));
}

#[tokio::test]
async fn lock_transient_scenario() {
    let fx = fixture();
    let transients = fx.store.transients();
    assert!(transients.set("lock", json!("1"), 60).await.unwrap());
    assert_eq!(transients.get("lock").await.unwrap(), json!("1"));

    fx.clock.advance(61);
    assert_eq!(transients.get("lock").await.unwrap(), json!(false));
}

#[tokio::test]
async fn lock_transient_scenario_on_shared_cache() {
    let clock = Arc::new(ManualClock::new(0));
    let table = Arc::new(MemoryTable::new());
    let shared = Arc::new(MemoryCache::shared(&CacheConfig::default(), clock.clone()));

    let first = OptionStore::new(table.clone(), shared.clone()).with_clock(clock.clone());
    let second = OptionStore::new(table.clone(), shared).with_clock(clock.clone());

    assert!(first.transients().set("lock", json!("1"), 60).await.unwrap());
    assert_eq!(second.transients().get("lock").await.unwrap(), json!("1"));

    clock.advance(61);
    assert_eq!(second.transients().get("lock").await.unwrap(), json!(false));
    assert!(table.is_empty().await);
}

#[tokio::test]
async fn lock_transient_scenario_without_cache() {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let table = Arc::new(MemoryTable::new());
    let store = OptionStore::new(table.clone(), Arc::new(optstore::NullCache))
        .with_clock(clock.clone());
    let transients = store.transients();

    // No row is autoloaded, so every bulk map read is the all-rows fallback
    assert!(transients.set("lock", json!("1"), 60).await.unwrap());
    assert!(autoloaded_rows(&table).await.is_empty());
    assert_eq!(transients.get("lock").await.unwrap(), json!("1"));

    clock.advance(61);
    assert_eq!(transients.get("lock").await.unwrap(), json!(false));
    assert!(table.is_empty().await);
}

#[tokio::test]
async fn lock_transient_scenario_after_cold_restart() {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let table = Arc::new(MemoryTable::new());
    let cache = Arc::new(MemoryCache::with_clock(&CacheConfig::default(), clock.clone()));
    let before = OptionStore::new(table.clone(), cache).with_clock(clock.clone());
    assert!(before.transients().set("lock", json!("1"), 60).await.unwrap());

    let cache = Arc::new(MemoryCache::with_clock(&CacheConfig::default(), clock.clone()));
    let after = OptionStore::new(table.clone(), cache).with_clock(clock.clone());
    assert_eq!(after.transients().get("lock").await.unwrap(), json!("1"));

    clock.advance(61);
    assert_eq!(after.transients().get("lock").await.unwrap(), json!(false));
    assert!(table.get_row("_transient_lock").await.unwrap().is_none());
    assert!(table.get_row("_transient_timeout_lock").await.unwrap().is_none());
}

#[tokio::test]
async fn writes_survive_without_cache() {
    let table = Arc::new(MemoryTable::new());
    let store = OptionStore::new(table.clone(), Arc::new(optstore::NullCache));

    store.add("a", json!("x"), Autoload::Yes).await.unwrap();
    store.add("b", json!("y"), Autoload::No).await.unwrap();
    assert!(!store.add("a", json!("z"), Autoload::Yes).await.unwrap());
    store.update("b", json!("w"), None).await.unwrap();

    assert_eq!(store.get("a").await.unwrap(), json!("x"));
    assert_eq!(store.get("b").await.unwrap(), json!("w"));
    for (name, value) in autoloaded_rows(&table).await {
        assert_eq!(store.get(&name).await.unwrap(), value);
    }
}
