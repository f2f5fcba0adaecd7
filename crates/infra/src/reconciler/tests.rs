use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use warden_auth::{Group, IdentityClaims, ProviderLink, User};
use warden_core::{ErrorKind, GroupId, UserId};

use super::*;
use crate::cache::{Cache, CacheError, InMemoryCache};
use crate::config::StoreConfig;
use crate::schema;

async fn test_pool() -> SqlitePool {
    warden_observability::init_for_tests();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    schema::apply(&pool).await.expect("schema");
    pool
}

async fn reconciler(pool: &SqlitePool) -> Reconciler {
    Reconciler::connect(pool.clone(), None, StoreConfig::default())
        .await
        .expect("connect")
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.expect("count")
}

fn gid(id: &str) -> GroupId {
    GroupId::new(id)
}

fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Cache whose every call fails.
struct BrokenCache;

impl Cache for BrokenCache {
    fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }

    fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }

    fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }
}

/// Counts ERROR events seen on the current thread.
struct ErrorEvents(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn seed_groups(rec: &mut Reconciler) {
    rec.save_group(&Group::new(gid("admins"), "Admins").with_permissions(["users.write", "users.read"]))
        .await
        .unwrap();
    rec.save_group(&Group::new(gid("staff"), "Staff").with_permissions(["users.read"]))
        .await
        .unwrap();
}

#[tokio::test]
async fn save_user_is_idempotent() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    seed_groups(&mut rec).await;

    let mut user = User::new();
    user.set("mail", "ana@example.com").unwrap();
    user.add_group(gid("admins"));
    user.add_group(gid("staff"));
    user.set_primary_group(Some(gid("staff"))).unwrap();
    user.add_provider(ProviderLink::new("github", "1")).unwrap();

    let first = rec.save_user(&mut user).await.unwrap();
    let second = rec.save_user(&mut user).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(user.id(), Some(&first));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_groups").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_groups WHERE main = 1").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_providers").await, 1);
}

#[tokio::test]
async fn internal_fields_are_not_persisted() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut user = User::new();
    user.set("id", "spoofed").unwrap();
    user.set("usr", "spoofed").unwrap();
    user.set("name", "Ana").unwrap();
    rec.save_user(&mut user).await.unwrap();

    let data: String = sqlx::query_scalar("SELECT data FROM users").fetch_one(&pool).await.unwrap();
    assert_eq!(serde_json::from_str::<Value>(&data).unwrap(), json!({"name": "Ana"}));
}

#[tokio::test]
async fn unknown_group_is_rejected_before_writing() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut user = User::new();
    user.add_group(gid("ghosts"));
    let err = rec.save_user(&mut user).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidState));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 0);
}

#[tokio::test]
async fn stale_id_is_replaced() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut user = User::with_id(UserId::new("ghost"));
    let id = rec.save_user(&mut user).await.unwrap();
    assert_ne!(id.as_str(), "ghost");
    assert_eq!(user.id(), Some(&id));
    assert!(rec.registry().get_user(&UserId::new("ghost")).is_err());
    assert!(rec.registry().get_user(&id).is_ok());
}

#[tokio::test]
async fn unique_fields_match_existing_rows() {
    let pool = test_pool().await;
    let config = StoreConfig::default().with_unique_fields(["mail"]);
    let mut rec = Reconciler::connect(pool.clone(), None, config).await.unwrap();

    let mut first = User::new();
    first.set("mail", "ana@example.com").unwrap();
    let id = rec.save_user(&mut first).await.unwrap();

    let mut again = User::new();
    again.set("mail", "ana@example.com").unwrap();
    again.set("name", "Ana").unwrap();
    assert_eq!(rec.save_user(&mut again).await.unwrap(), id);

    let mut other = User::new();
    other.set("mail", "bob@example.com").unwrap();
    assert_ne!(rec.save_user(&mut other).await.unwrap(), id);

    let mut anonymous = User::new();
    anonymous.set("name", "No mail").unwrap();
    assert_ne!(rec.save_user(&mut anonymous).await.unwrap(), id);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 3);
}

#[tokio::test]
async fn provider_pairs_are_never_stolen() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut alice = User::new();
    alice.add_provider(ProviderLink::new("github", "1")).unwrap();
    let alice_id = rec.save_user(&mut alice).await.unwrap();

    let mut mallory = User::new();
    mallory.add_provider(ProviderLink::new("github", "1")).unwrap();
    let mallory_id = rec.save_user(&mut mallory).await.unwrap();
    assert_ne!(alice_id, mallory_id);

    let owner: String = sqlx::query_scalar("SELECT usr FROM user_providers WHERE provider = 'github' AND id = '1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(owner, alice_id.as_str());

    let found = rec.get_user_by_provider_id("github", "1").await.unwrap();
    assert_eq!(found.id(), Some(&alice_id));
}

#[tokio::test]
async fn dropped_links_are_deleted() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut user = User::new();
    user.add_provider(ProviderLink::new("github", "1")).unwrap();
    user.add_provider(ProviderLink::new("google", "a")).unwrap();
    rec.save_user(&mut user).await.unwrap();

    user.remove_provider("google", "a");
    rec.save_user(&mut user).await.unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_providers").await, 1);
    assert!(rec.get_user_by_provider_id("google", "a").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn provider_lookup_stamps_usage_and_skips_disabled() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    let mut user = User::new();
    user.add_provider(ProviderLink::new("github", "1")).unwrap();
    user.add_provider(ProviderLink::new("google", "a")).unwrap();
    user.provider_mut("google", "a").unwrap().disabled = true;
    rec.save_user(&mut user).await.unwrap();

    let found = rec.get_user_by_provider_id("github", "1").await.unwrap();
    assert!(found.provider("github", "1").unwrap().last_used_at.is_some());
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM user_providers WHERE provider = 'github' AND used IS NOT NULL").await,
        1
    );

    let err = rec.get_user_by_provider_id("google", "a").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn users_hydrate_from_the_store() {
    let pool = test_pool().await;
    let id = {
        let mut rec = reconciler(&pool).await;
        seed_groups(&mut rec).await;
        let mut user = User::new();
        user.set("profile.city", "Sofia").unwrap();
        user.add_group(gid("admins"));
        user.add_group(gid("staff"));
        user.set_primary_group(Some(gid("admins"))).unwrap();
        user.add_provider(
            ProviderLink::new("github", "1")
                .with_display_name("ana")
                .with_data(json!({"login": "ana"})),
        )
        .unwrap();
        rec.save_user(&mut user).await.unwrap()
    };

    let mut fresh = reconciler(&pool).await;
    assert!(fresh.registry().get_user(&id).is_err());
    let user = fresh.get_user(&id).await.unwrap();
    assert_eq!(user.data().get_str("profile.city"), Some("Sofia"));
    assert_eq!(user.primary_group(), Some(&gid("admins")));
    assert!(user.in_group(&gid("staff")));
    let link = user.provider("github", "1").unwrap();
    assert_eq!(link.display_name.as_deref(), Some("ana"));
    assert_eq!(link.data, Some(json!({"login": "ana"})));
    assert!(fresh.registry().has_permission(&user, "users.write"));

    assert!(fresh.get_user(&UserId::new("nobody")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn groups_hydrate_and_rename() {
    let pool = test_pool().await;
    {
        let mut rec = reconciler(&pool).await;
        seed_groups(&mut rec).await;
        let mut renamed = rec.get_group(&gid("staff")).await.unwrap();
        renamed.set_name("Crew");
        renamed.add_permission("reports.read");
        rec.save_group(&renamed).await.unwrap();
    }

    let mut fresh = reconciler(&pool).await;
    let staff = fresh.get_group(&gid("staff")).await.unwrap();
    assert_eq!(staff.name(), "Crew");
    assert!(staff.has_permission("reports.read"));
    assert!(fresh.registry().permission_exists("reports.read"));
    assert!(fresh.get_group(&gid("nope")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn generated_group_ids_insert_new_rows() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    let id = GroupId::generate();
    rec.save_group(&Group::new(id.clone(), "Fresh")).await.unwrap();

    let mut fresh = reconciler(&pool).await;
    assert_eq!(fresh.get_group(&id).await.unwrap().name(), "Fresh");
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM \"groups\"").await, 1);
}

#[tokio::test]
async fn permission_catalog_cascade() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    rec.add_permission("a").await.unwrap();
    rec.add_permission("b").await.unwrap();
    assert_eq!(rec.add_permission("a").await.unwrap_err().kind(), Some(ErrorKind::AlreadyExists));

    rec.save_group(&Group::new(gid("g"), "G").with_permissions(["a", "b"]))
        .await
        .unwrap();
    rec.delete_permission("a").await.unwrap();

    let cached = rec.registry().get_group(&gid("g")).unwrap();
    assert!(!cached.has_permission("a"));
    assert!(cached.has_permission("b"));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM group_permissions WHERE perm = 'a'").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM permissions WHERE perm = 'a'").await, 0);
    assert_eq!(rec.delete_permission("a").await.unwrap_err().kind(), Some(ErrorKind::NotFound));

    let fresh = reconciler(&pool).await;
    let group = fresh.registry().get_group(&gid("g")).unwrap();
    assert!(!group.has_permission("a"));
    assert!(group.has_permission("b"));
}

#[tokio::test]
async fn deleting_a_group_clears_primary() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    seed_groups(&mut rec).await;

    let mut user = User::new();
    user.add_group(gid("admins"));
    user.add_group(gid("staff"));
    user.set_primary_group(Some(gid("admins"))).unwrap();
    let id = rec.save_user(&mut user).await.unwrap();

    rec.delete_group(&gid("admins")).await.unwrap();
    let cached = rec.get_user(&id).await.unwrap();
    assert!(!cached.in_group(&gid("admins")));
    assert_eq!(cached.primary_group(), None);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_groups").await, 1);

    let mut fresh = reconciler(&pool).await;
    let hydrated = fresh.get_user(&id).await.unwrap();
    assert_eq!(hydrated.primary_group(), None);
    assert!(hydrated.in_group(&gid("staff")));

    assert_eq!(
        rec.delete_group(&gid("admins")).await.unwrap_err().kind(),
        Some(ErrorKind::NotFound)
    );
}

#[tokio::test]
async fn delete_user_removes_dependent_rows() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    seed_groups(&mut rec).await;

    let mut user = User::new();
    user.add_group(gid("staff"));
    user.add_provider(ProviderLink::new("github", "1")).unwrap();
    let id = rec.save_user(&mut user).await.unwrap();

    rec.delete_user(&id).await.unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_groups").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM user_providers").await, 0);
    assert!(rec.registry().get_user(&id).is_err());
    assert_eq!(rec.delete_user(&id).await.unwrap_err().kind(), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn failed_save_rolls_back_everything() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    sqlx::query("DROP TABLE user_providers").execute(&pool).await.unwrap();

    let mut user = User::new();
    user.set("name", "Ana").unwrap();
    user.add_provider(ProviderLink::new("github", "1")).unwrap();
    let err = rec.save_user(&mut user).await.unwrap_err();

    assert!(matches!(err, StoreError::Storage { .. }));
    assert_eq!(err.kind(), None);
    assert!(user.id().is_none());
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 0);
    assert_eq!(rec.registry().users().count(), 0);
}

#[tokio::test]
async fn search_users_filters_on_data() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;

    for (mail, city, age) in [("ana@example.com", "Sofia", 30), ("bob@example.com", "Varna", 41)] {
        let mut user = User::new();
        user.set("mail", mail).unwrap();
        user.set("profile.city", city).unwrap();
        user.set("age", age).unwrap();
        rec.save_user(&mut user).await.unwrap();
    }

    let hits = rec.search_users(&map(json!({"profile.city": "Sofia"}))).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].data().get_str("mail"), Some("ana@example.com"));

    let hits = rec.search_users(&map(json!({"age": 41}))).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(rec.search_users(&Map::new()).await.unwrap().len(), 2);
    assert!(rec.search_users(&map(json!({"mail": "nobody"}))).await.unwrap().is_empty());

    for bad in [json!({"ma il": "x"}), json!({"profile": {"city": "Sofia"}}), json!({"a..b": 1})] {
        let err = rec.search_users(&map(bad)).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidFilter));
    }
}

#[tokio::test]
async fn user_for_identity_registers_once() {
    let pool = test_pool().await;
    let mut rec = reconciler(&pool).await;
    let identity = IdentityClaims::from_claims(map(json!({
        "provider": "github",
        "id": "7",
        "name": "Ana",
        "mail": "ana@example.com",
    })))
    .unwrap();

    assert!(rec.user_for_identity(&identity, false).await.unwrap_err().is_not_found());
    let created = rec.user_for_identity(&identity, true).await.unwrap();
    assert_eq!(created.data().get_str("name"), Some("Ana"));

    let found = rec.user_for_identity(&identity, true).await.unwrap();
    assert_eq!(found.id(), created.id());
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users").await, 1);
}

#[tokio::test]
async fn lookup_misses_are_not_logged_as_errors() {
    let pool = test_pool().await;
    let errors = Arc::new(AtomicUsize::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorEvents(errors.clone())),
    );

    let mut rec = reconciler(&pool).await;
    let identity = IdentityClaims::from_claims(map(json!({"provider": "github", "id": "9"}))).unwrap();
    rec.user_for_identity(&identity, true).await.unwrap();
    assert!(rec.get_user(&UserId::new("nobody")).await.unwrap_err().is_not_found());
    assert!(rec.get_group(&gid("nobody")).await.unwrap_err().is_not_found());

    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bootstrap_reads_and_fills_the_cache() {
    let pool = test_pool().await;
    let cache = Arc::new(InMemoryCache::new());
    let config = StoreConfig::default();
    {
        let mut rec = Reconciler::connect(pool.clone(), Some(cache.clone()), config.clone())
            .await
            .unwrap();
        seed_groups(&mut rec).await;
        assert_eq!(cache.get(&config.groups_key()).unwrap(), None);
        assert_eq!(cache.get(&config.permissions_key()).unwrap(), None);
    }

    let rec = Reconciler::connect(pool.clone(), Some(cache.clone()), config.clone())
        .await
        .unwrap();
    assert!(rec.registry().group_exists(&gid("admins")));
    assert_eq!(
        cache.get(&config.permissions_key()).unwrap(),
        Some(json!(["users.read", "users.write"]))
    );
    assert!(cache.get(&config.groups_key()).unwrap().is_some());

    // A warm cache is trusted over the store.
    cache
        .set(&config.permissions_key(), &json!(["from.cache"]), Duration::from_secs(60))
        .unwrap();
    let rec = Reconciler::connect(pool.clone(), Some(cache.clone()), config).await.unwrap();
    assert!(rec.registry().permission_exists("from.cache"));
}

#[tokio::test]
async fn cache_failures_are_absorbed() {
    let pool = test_pool().await;
    let mut rec = Reconciler::connect(pool.clone(), Some(Arc::new(BrokenCache)), StoreConfig::default())
        .await
        .unwrap();
    seed_groups(&mut rec).await;
    rec.add_permission("extra").await.unwrap();
    rec.delete_group(&gid("staff")).await.unwrap();

    let rec = Reconciler::connect(pool, Some(Arc::new(BrokenCache)), StoreConfig::default())
        .await
        .unwrap();
    assert!(rec.registry().group_exists(&gid("admins")));
    assert!(rec.registry().permission_exists("extra"));
}

#[test]
fn json_paths_are_validated() {
    assert_eq!(json_path("profile.city").unwrap(), "$.profile.city");
    for bad in ["", ".a", "a.", "a..b", "a b", "a'b", "a[0]"] {
        assert!(json_path(bad).is_err(), "{bad}");
    }
}
