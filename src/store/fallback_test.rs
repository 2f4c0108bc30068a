use time::macros::datetime;

use super::*;
use crate::store::MemoryStore;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn fixture() -> (Arc<MemoryStore>, FallbackStore) {
    let kv = Arc::new(MemoryStore::new());
    let store = FallbackStore::new(kv.clone());
    (kv, store)
}

fn cached_user() -> CachedUser {
    CachedUser {
        id: "user-1".into(),
        email: "ada@example.com".into(),
        metadata: UserMetadata { role: Some("tenant".into()), ..UserMetadata::default() },
    }
}

// =============================================================================
// cached session
// =============================================================================

#[test]
fn fresh_session_round_trips() {
    let (_, store) = fixture();
    let written_at = datetime!(2025-01-01 12:00 UTC);
    let session = CachedSession::new("token", cached_user(), written_at);
    store.write_cached_session(&session);

    let read = store.read_cached_session(written_at + time::Duration::hours(23), Some(DAY));
    assert_eq!(read, Some(session));
}

#[test]
fn stored_shape_uses_camel_case_keys() {
    let (kv, store) = fixture();
    store.write_cached_session(&CachedSession::new("token", cached_user(), datetime!(2025-01-01 0:00 UTC)));
    let raw = kv.get(DIRECT_SESSION_KEY).unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["accessToken"], "token");
    assert_eq!(value["user"]["id"], "user-1");
    assert_eq!(value["timestamp"], 1_735_689_600_000_i64);
}

#[test]
fn session_older_than_a_day_is_purged() {
    let (kv, store) = fixture();
    let written_at = datetime!(2025-01-01 12:00 UTC);
    store.write_cached_session(&CachedSession::new("token", cached_user(), written_at));

    let read = store.read_cached_session(written_at + time::Duration::hours(25), Some(DAY));
    assert_eq!(read, None);
    assert_eq!(kv.get(DIRECT_SESSION_KEY).unwrap(), None);
}

#[test]
fn session_exactly_a_day_old_is_stale() {
    let (_, store) = fixture();
    let written_at = datetime!(2025-01-01 12:00 UTC);
    store.write_cached_session(&CachedSession::new("token", cached_user(), written_at));
    assert_eq!(store.read_cached_session(written_at + time::Duration::days(1), Some(DAY)), None);
}

#[test]
fn unbounded_read_ignores_age() {
    let (_, store) = fixture();
    let written_at = datetime!(2025-01-01 12:00 UTC);
    store.write_cached_session(&CachedSession::new("token", cached_user(), written_at));
    let read = store.read_cached_session(written_at + time::Duration::days(30), None);
    assert!(read.is_some());
}

#[test]
fn missing_token_is_purged_even_without_age_bound() {
    let (kv, store) = fixture();
    kv.set(DIRECT_SESSION_KEY, r#"{"user":{"id":"user-1"},"timestamp":1}"#)
        .unwrap();
    assert_eq!(store.read_cached_session(datetime!(2025-01-01 0:00 UTC), None), None);
    assert_eq!(kv.get(DIRECT_SESSION_KEY).unwrap(), None);
}

#[test]
fn missing_user_is_purged() {
    let (kv, store) = fixture();
    kv.set(DIRECT_SESSION_KEY, r#"{"accessToken":"t","timestamp":1}"#)
        .unwrap();
    assert_eq!(store.read_cached_session(datetime!(2025-01-01 0:00 UTC), None), None);
    assert_eq!(kv.get(DIRECT_SESSION_KEY).unwrap(), None);
}

#[test]
fn garbage_is_purged() {
    let (kv, store) = fixture();
    kv.set(DIRECT_SESSION_KEY, "not json").unwrap();
    assert_eq!(store.read_cached_session(datetime!(2025-01-01 0:00 UTC), Some(DAY)), None);
    assert_eq!(kv.get(DIRECT_SESSION_KEY).unwrap(), None);
}

#[test]
fn absent_session_reads_none() {
    let (_, store) = fixture();
    assert_eq!(store.read_cached_session(datetime!(2025-01-01 0:00 UTC), Some(DAY)), None);
}

// =============================================================================
// signup hints and flags
// =============================================================================

#[test]
fn signup_hints_round_trip_and_clear() {
    let (_, store) = fixture();
    let hints = SignupHints {
        role: Some(Role::Tenant),
        first_name: Some("Ada".into()),
        last_name: Some("Lovelace".into()),
    };
    store.write_signup_hints(&hints);
    assert_eq!(store.signup_hints(), hints);

    store.clear_signup_hints();
    assert_eq!(store.signup_hints(), SignupHints::default());
}

#[test]
fn unrecognized_hint_role_is_unset() {
    let (kv, store) = fixture();
    kv.set(SIGNUP_ROLE_KEY, "superuser").unwrap();
    kv.set(SIGNUP_FIRST_NAME_KEY, "  ").unwrap();
    let hints = store.signup_hints();
    assert_eq!(hints.role, None);
    assert_eq!(hints.first_name, None);
}

#[test]
fn writing_partial_hints_removes_absent_fields() {
    let (kv, store) = fixture();
    kv.set(SIGNUP_LAST_NAME_KEY, "Old").unwrap();
    store.write_signup_hints(&SignupHints { role: Some(Role::Landlord), ..SignupHints::default() });
    assert_eq!(kv.get(SIGNUP_LAST_NAME_KEY).unwrap(), None);
    assert_eq!(kv.get(SIGNUP_ROLE_KEY).unwrap().as_deref(), Some("landlord"));
}

#[test]
fn clear_auth_artifacts_removes_every_key() {
    let (kv, store) = fixture();
    store.write_cached_session(&CachedSession::new("token", cached_user(), datetime!(2025-01-01 0:00 UTC)));
    store.write_signup_hints(&SignupHints {
        role: Some(Role::Tenant),
        first_name: Some("Ada".into()),
        last_name: Some("Lovelace".into()),
    });
    store.set_linking_google(true);
    store.mark_session_active(true);
    assert!(store.is_linking_google());
    assert!(store.is_session_active());

    store.clear_auth_artifacts();
    for key in AUTH_ARTIFACT_KEYS {
        assert_eq!(kv.get(key).unwrap(), None, "{key} should be cleared");
    }
}
