use super::*;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

fn token_with(payload: serde_json::Value) -> String {
    encode(
        &Header::default(),
        &payload,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("token")
}

#[test]
fn decodes_numeric_string_role_and_url_encoded_name() {
    let token = token_with(json!({
        "role": "2",
        "unique_name": "%E5%B0%8F%E6%98%8E",
        "exp": 1_700_000_000,
    }));
    let claims = decode_claims(&token).expect("claims");
    assert_eq!(claims.role, Role::Admin);
    assert_eq!(claims.subject_name, "小明");
    assert_eq!(claims.expires_at_unix, 1_700_000_000);
}

#[test]
fn missing_role_is_guest_and_unknown_role_is_rejected() {
    let guest = token_with(json!({ "unique_name": "visitor", "exp": 10 }));
    assert_eq!(decode_claims(&guest).expect("claims").role, Role::Guest);

    let numeric = token_with(json!({ "role": 1, "exp": 10 }));
    assert_eq!(decode_claims(&numeric).expect("claims").role, Role::User);

    let unknown = token_with(json!({ "role": "7", "exp": 10 }));
    assert!(decode_claims(&unknown).is_none());
}

#[test]
fn garbage_tokens_have_no_claims() {
    assert!(decode_claims("").is_none());
    assert!(decode_claims("not-a-jwt").is_none());
    assert!(decode_claims("a.!!!.c").is_none());
    let no_exp = token_with(json!({ "role": 1 }));
    assert!(decode_claims(&no_exp).is_none());
}

#[tokio::test]
async fn reads_follow_remember_me_flag() {
    let store = CredentialStore::in_memory();
    store
        .set(TokenKind::Access, "durable-token", Scope::Persistent)
        .await
        .expect("set durable");
    store
        .set(TokenKind::Access, "session-token", Scope::Ephemeral)
        .await
        .expect("set session");

    assert_eq!(
        store.get(TokenKind::Access).await.expect("get").as_deref(),
        Some("session-token")
    );

    store.set_remember_me(true).await.expect("remember");
    assert_eq!(store.active_scope().await.expect("scope"), Scope::Persistent);
    assert_eq!(
        store.get(TokenKind::Access).await.expect("get").as_deref(),
        Some("durable-token")
    );
}

#[tokio::test]
async fn clear_all_removes_every_token_slot() {
    let durable = Arc::new(MemoryScope::new());
    let session = Arc::new(MemoryScope::new());
    let store = CredentialStore::new(durable.clone(), session.clone());

    for scope in [Scope::Persistent, Scope::Ephemeral] {
        store.set(TokenKind::Access, "a", scope).await.expect("set");
        store.set(TokenKind::Refresh, "r", scope).await.expect("set");
    }
    store.set_remember_me(true).await.expect("remember");

    store.clear_all().await.expect("clear");

    for scope in [&durable, &session] {
        assert!(scope.get(ACCESS_TOKEN_KEY).await.expect("get").is_none());
        assert!(scope.get(REFRESH_TOKEN_KEY).await.expect("get").is_none());
    }
    // The preference survives logout.
    assert!(store.remember_me().await.expect("flag"));
    assert!(store.claims(TokenKind::Access).await.is_none());
}

#[tokio::test]
async fn claims_cache_follows_token_replacement() {
    let store = CredentialStore::in_memory();
    let first = token_with(json!({ "role": "1", "unique_name": "bob", "exp": 100 }));
    let second = token_with(json!({ "role": "1", "unique_name": "bob", "exp": 200 }));

    store.save(TokenKind::Access, &first).await.expect("save");
    assert_eq!(
        store.claims(TokenKind::Access).await.map(|c| c.expires_at_unix),
        Some(100)
    );

    store.save(TokenKind::Access, &second).await.expect("save");
    assert_eq!(
        store.claims(TokenKind::Access).await.map(|c| c.expires_at_unix),
        Some(200)
    );
}

#[tokio::test]
async fn guests_are_not_logged_in() {
    let store = CredentialStore::in_memory();
    assert!(!store.is_logged_in().await);

    let guest = token_with(json!({ "role": "0", "exp": 100 }));
    store.save(TokenKind::Access, &guest).await.expect("save");
    assert!(!store.is_logged_in().await);

    let user = token_with(json!({ "role": "1", "exp": 100 }));
    store.save(TokenKind::Access, &user).await.expect("save");
    assert!(store.is_logged_in().await);
}

#[tokio::test]
async fn json_file_scope_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("credentials.json");

    {
        let scope = JsonFileScope::new(&path);
        scope.set(ACCESS_TOKEN_KEY, "persisted").await.expect("set");
        scope.set(REMEMBER_ME_KEY, "true").await.expect("set");
        scope.remove(REMEMBER_ME_KEY).await.expect("remove");
    }

    let reopened = JsonFileScope::new(&path);
    assert_eq!(
        reopened.get(ACCESS_TOKEN_KEY).await.expect("get").as_deref(),
        Some("persisted")
    );
    assert!(reopened.get(REMEMBER_ME_KEY).await.expect("get").is_none());
}

#[tokio::test]
async fn store_login_writes_to_selected_scope() {
    let durable = Arc::new(MemoryScope::new());
    let session = Arc::new(MemoryScope::new());
    let store = CredentialStore::new(durable.clone(), session.clone());

    store.store_login("a", "r", false).await.expect("login");
    assert_eq!(session.get(ACCESS_TOKEN_KEY).await.expect("get").as_deref(), Some("a"));
    assert!(durable.get(ACCESS_TOKEN_KEY).await.expect("get").is_none());

    store.store_login("a2", "r2", true).await.expect("login");
    assert_eq!(durable.get(REFRESH_TOKEN_KEY).await.expect("get").as_deref(), Some("r2"));
}
