//! End-to-end token lifecycle: each "run" builds a fresh manager over the same
//! on-disk store, the way the scheduled job does.

use chrono::{Duration, Utc};
use mockito::{Matcher, Server, ServerGuard};
use std::path::Path;
use std::sync::Arc;
use whoop_sync::api::{ApiClient, DateRange, Resource};
use whoop_sync::config::{Secret, StorageBackend, SyncConfig};
use whoop_sync::credentials::{
    CipherKey, CipherMode, CredentialRecord, CredentialStore, FileCredentialStore,
    SqliteCredentialStore,
};
use whoop_sync::token::{BootstrapTokens, HttpTokenExchange, TokenError, TokenManager, TokenState};

fn exchange(server: &ServerGuard) -> Arc<HttpTokenExchange> {
    Arc::new(
        HttpTokenExchange::new(
            format!("{}/oauth/oauth2/token", server.url()),
            "client-id".to_string(),
            Secret::new("client-secret".to_string()),
            vec!["offline".to_string(), "read:cycles".to_string()],
        )
        .unwrap(),
    )
}

fn sealed_sqlite(path: &Path, key: &CipherKey) -> Arc<dyn CredentialStore> {
    Arc::new(SqliteCredentialStore::open(path, CipherMode::Authenticated(key.clone())).unwrap())
}

fn token_response(access: &str, refresh: &str) -> String {
    format!(
        r#"{{"access_token":"{}","refresh_token":"{}","expires_in":3600,"token_type":"bearer"}}"#,
        access, refresh
    )
}

#[tokio::test]
async fn test_rotated_refresh_token_survives_restart() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("credentials.db");
    let key = CipherKey::generate();

    sealed_sqlite(&db, &key)
        .save(&CredentialRecord::new(
            "A1".to_string(),
            "R1".to_string(),
            Utc::now() - Duration::seconds(10),
        ))
        .unwrap();

    let first_refresh = server
        .mock("POST", "/oauth/oauth2/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "R1".into()))
        .with_status(200)
        .with_body(token_response("A2", "R2"))
        .expect(1)
        .create_async()
        .await;

    // Run 1: stale record, one exchange
    {
        let manager = TokenManager::new(sealed_sqlite(&db, &key), exchange(&server), None);
        assert_eq!(manager.get_valid_token().await.unwrap(), "A2");
    }
    first_refresh.assert_async().await;

    // Run 2: fresh record from disk, no exchange
    {
        let manager = TokenManager::new(sealed_sqlite(&db, &key), exchange(&server), None);
        assert_eq!(manager.get_valid_token().await.unwrap(), "A2");
        assert_eq!(manager.status().unwrap().state, TokenState::Valid);
    }

    // Run 3: forced refresh must use the rotated token
    let second_refresh = server
        .mock("POST", "/oauth/oauth2/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "R2".into()))
        .with_status(200)
        .with_body(token_response("A3", "R3"))
        .expect(1)
        .create_async()
        .await;
    {
        let manager = TokenManager::new(sealed_sqlite(&db, &key), exchange(&server), None);
        manager.force_refresh().await.unwrap();
        assert_eq!(manager.get_valid_token().await.unwrap(), "A3");
    }
    second_refresh.assert_async().await;

    let stored = sealed_sqlite(&db, &key).load().unwrap().unwrap();
    assert_eq!(stored.refresh_token, "R3");
}

#[tokio::test]
async fn test_bootstrap_then_stored_record_takes_over() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let key = CipherKey::generate();
    let store = || -> Arc<dyn CredentialStore> {
        Arc::new(FileCredentialStore::new(
            &path,
            CipherMode::Authenticated(key.clone()),
        ))
    };

    let refresh = server
        .mock("POST", "/oauth/oauth2/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "BOOT-R".into()))
        .with_status(200)
        .with_body(token_response("access-after-bootstrap", "refresh-after-bootstrap"))
        .expect(1)
        .create_async()
        .await;

    let bootstrap = BootstrapTokens {
        access_token: "BOOT-A".to_string(),
        refresh_token: "BOOT-R".to_string(),
        expires_at: None,
    };

    // Bootstrap without expiry is refreshed on first use and persisted
    {
        let manager = TokenManager::new(store(), exchange(&server), Some(bootstrap.clone()));
        assert_eq!(
            manager.status().unwrap().state,
            TokenState::Stale,
            "bootstrap without expiry counts as expired"
        );
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-after-bootstrap");
    }

    // Later runs ignore the (now void) bootstrap pair
    {
        let manager = TokenManager::new(store(), exchange(&server), Some(bootstrap));
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-after-bootstrap");
    }

    refresh.assert_async().await;
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("access-after-bootstrap"));
    assert!(!raw.contains("refresh-after-bootstrap"));
}

#[tokio::test]
async fn test_invalid_grant_keeps_last_known_good_record() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("credentials.db");
    let key = CipherKey::generate();
    let expired = CredentialRecord::new(
        "A1".to_string(),
        "R1".to_string(),
        Utc::now() - Duration::minutes(1),
    );
    sealed_sqlite(&db, &key).save(&expired).unwrap();

    let _rejected = server
        .mock("POST", "/oauth/oauth2/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;

    let manager = TokenManager::new(sealed_sqlite(&db, &key), exchange(&server), None);
    let err = manager.get_valid_token().await.unwrap_err();

    assert!(matches!(err, TokenError::RefreshFailed(_)));
    assert_eq!(manager.status().unwrap().state, TokenState::Failed);
    assert_eq!(sealed_sqlite(&db, &key).load().unwrap().unwrap(), expired);
}

#[tokio::test]
async fn test_api_client_recovers_from_revoked_access_token() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("credentials.db");
    let key = CipherKey::generate();
    sealed_sqlite(&db, &key)
        .save(&CredentialRecord::new(
            "A1".to_string(),
            "R1".to_string(),
            Utc::now() + Duration::hours(1),
        ))
        .unwrap();

    let revoked = server
        .mock("GET", "/developer/v1/cycle")
        .match_header("authorization", "Bearer A1")
        .match_query(Matcher::Any)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth/oauth2/token")
        .with_status(200)
        .with_body(token_response("A2", "R2"))
        .expect(1)
        .create_async()
        .await;
    let cycles = server
        .mock("GET", "/developer/v1/cycle")
        .match_header("authorization", "Bearer A2")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"records":[{"id":93845,"score_state":"SCORED"}],"next_token":"MTIzOjEyMzEyMw"}"#)
        .expect(1)
        .create_async()
        .await;

    let manager = Arc::new(TokenManager::new(
        sealed_sqlite(&db, &key),
        exchange(&server),
        None,
    ));
    let client = ApiClient::new(format!("{}/developer/v1", server.url()), manager).unwrap();
    let page = client
        .fetch_page(Resource::Cycles, &DateRange::last_days(7).unwrap(), None)
        .await
        .unwrap();

    assert_eq!(page.records.len(), 1);
    assert_eq!(page.next_token.as_deref(), Some("MTIzOjEyMzEyMw"));
    revoked.assert_async().await;
    refresh.assert_async().await;
    cycles.assert_async().await;
    assert_eq!(
        sealed_sqlite(&db, &key).load().unwrap().unwrap().refresh_token,
        "R2"
    );
}

#[tokio::test]
async fn test_config_wires_store_and_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let key = CipherKey::generate().to_base64();
    let path_str = path.to_string_lossy().to_string();

    let vars = [
        ("WHOOP_STORAGE_BACKEND", "file"),
        ("WHOOP_CREDENTIALS_PATH", path_str.as_str()),
        ("WHOOP_ENCRYPTION_KEY", key.as_str()),
        ("WHOOP_ACCESS_TOKEN", "BOOT-A"),
        ("WHOOP_REFRESH_TOKEN", "BOOT-R"),
        ("WHOOP_TOKEN_EXPIRES_AT", "2099-01-01T00:00:00Z"),
    ];
    let config = SyncConfig::default()
        .with_overrides(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
        .unwrap();
    assert_eq!(config.storage.backend, StorageBackend::File);

    let server = Server::new_async().await;
    let manager = TokenManager::new(
        config.open_store().unwrap(),
        exchange(&server),
        config.bootstrap_tokens().unwrap(),
    );

    assert_eq!(manager.get_valid_token().await.unwrap(), "BOOT-A");
    assert_eq!(manager.status().unwrap().state, TokenState::Bootstrapped);
    assert!(!path.exists(), "bootstrap pair is not persisted until a refresh");
}
