use super::*;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

fn settings_in(dir: &std::path::Path) -> Settings {
    Settings {
        credentials_path: dir.join("credentials.json"),
        ..Settings::default()
    }
}

fn user_token() -> String {
    encode(
        &Header::default(),
        &json!({ "role": "1", "unique_name": "dave", "exp": 4_000_000_000i64 }),
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("token")
}

#[tokio::test]
async fn remembered_login_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = user_token();

    let client = ChatClient::from_settings(settings_in(dir.path()));
    client
        .login_with_tokens(&token, "refresh", true)
        .await
        .expect("login");
    assert!(client.credentials().is_logged_in().await);

    let restarted = ChatClient::from_settings(settings_in(dir.path()));
    assert_eq!(
        restarted
            .credentials()
            .get(TokenKind::Access)
            .await
            .expect("get")
            .as_deref(),
        Some(token.as_str())
    );
    assert_eq!(restarted.coordinator().ensure_fresh().await, RefreshOutcome::Fresh);
}

#[tokio::test]
async fn session_only_login_is_forgotten_on_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let client = ChatClient::from_settings(settings_in(dir.path()));
    client
        .login_with_tokens(&user_token(), "refresh", false)
        .await
        .expect("login");

    let restarted = ChatClient::from_settings(settings_in(dir.path()));
    assert!(!restarted.credentials().is_logged_in().await);
}

#[tokio::test]
async fn unreadable_token_is_rejected_and_logout_clears() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ChatClient::from_settings(settings_in(dir.path()));

    assert!(matches!(
        client.login_with_tokens("opaque", "refresh", false).await,
        Err(SessionError::ValidationRejected(_))
    ));

    client
        .login_with_tokens(&user_token(), "refresh", true)
        .await
        .expect("login");
    client.logout().await.expect("logout");
    assert!(client
        .credentials()
        .get(TokenKind::Refresh)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn fresh_manager_starts_disconnected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ChatClient::from_settings(settings_in(dir.path()));
    let manager = client.connection_manager();

    assert_eq!(manager.state().await, ConnectionState::Disconnected);
    assert!(matches!(
        manager.fetch_next_page().await,
        Err(SessionError::NotConnected)
    ));
}
