//! Collection key cache: epoch binding, fallback keys, and concurrent access.

mod support;

use cairn_crypto::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt};
use cairn_sync::bundle::KeyBundle;
use cairn_sync::key_manager::CollectionKeyManager;
use cairn_sync::remote_state::RemoteStateClient;
use cairn_sync::SyncError;
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tokio_test::{assert_err, assert_ok};

fn bundle_key() -> DerivedKey {
    derive_key(PASSPHRASE, &Salt::for_account(ACCOUNT), &KdfParams::fast()).unwrap()
}

fn manager(server: &Arc<MemoryBackend>) -> CollectionKeyManager {
    let remote = Arc::new(RemoteStateClient::new(server.clone(), Duration::from_secs(5)));
    CollectionKeyManager::new(remote, &credentials(), KdfParams::fast())
}

fn publish(server: &MemoryBackend, bundle: &KeyBundle) {
    server.put_raw("crypto", "keys", &bundle.seal(&bundle_key()).unwrap());
}

#[tokio::test]
async fn bundle_key_is_deterministic_per_account() {
    let server = MemoryBackend::new();
    let a = manager(&server).bundle_key().await.unwrap();
    let b = manager(&server).bundle_key().await.unwrap();
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(a.as_bytes(), bundle_key().as_bytes());
}

#[tokio::test]
async fn refresh_requires_an_epoch() {
    let server = MemoryBackend::new();
    let keys = manager(&server);

    let err = keys.refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::NotAvailable(_)), "got: {err:?}");
}

#[tokio::test]
async fn missing_bundle_is_not_found() {
    let server = MemoryBackend::new();
    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;

    let err = assert_err!(keys.refresh().await);
    assert!(err.is_absent_or_malformed());
    assert!(!keys.is_loaded().await);
}

#[tokio::test]
async fn overrides_win_and_default_covers_the_rest() {
    let server = MemoryBackend::new();
    let default = generate_random_key();
    let passwords = generate_random_key();
    publish(
        &server,
        &KeyBundle::new(default.clone()).with_override("passwords", passwords.clone()),
    );

    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;
    assert_ok!(keys.refresh().await);

    let got = keys.get_key_for("passwords").await.unwrap();
    assert_eq!(got.as_bytes(), passwords.as_bytes());
    let got = keys.get_key_for("history").await.unwrap();
    assert_eq!(got.as_bytes(), default.as_bytes());
}

#[tokio::test]
async fn keys_are_served_from_cache_within_an_epoch() {
    let server = MemoryBackend::new();
    publish(&server, &KeyBundle::generate());
    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;

    let first = keys.get_key_for("tabs").await.unwrap();
    server.clear_log();
    let second = keys.get_key_for("tabs").await.unwrap();

    assert_eq!(first.as_bytes(), second.as_bytes());
    assert!(server.log().is_empty(), "cache hit must not fetch: {:?}", server.log());
}

#[tokio::test]
async fn binding_a_new_epoch_drops_cached_keys() {
    let server = MemoryBackend::new();
    let old = KeyBundle::generate();
    publish(&server, &old);
    let keys = manager(&server);

    assert!(!keys.bind_epoch("epoch-1", None).await);
    keys.refresh().await.unwrap();
    assert!(!keys.bind_epoch("epoch-1", None).await);
    assert!(keys.is_loaded().await);

    let new = KeyBundle::generate();
    publish(&server, &new);
    assert!(keys.bind_epoch("epoch-2", None).await);
    assert!(!keys.is_loaded().await);
    assert_eq!(keys.epoch().await.as_deref(), Some("epoch-2"));

    let got = keys.get_key_for("forms").await.unwrap();
    assert_eq!(got.as_bytes(), new.default_key().as_bytes());
}

#[tokio::test]
async fn moved_bundle_timestamp_drops_cached_keys() {
    let server = MemoryBackend::new();
    publish(&server, &KeyBundle::generate());
    let keys = manager(&server);

    assert!(!keys.bind_epoch("epoch-1", Some(1.0)).await);
    keys.refresh().await.unwrap();
    assert!(!keys.bind_epoch("epoch-1", Some(1.0)).await);
    assert!(keys.is_loaded().await);

    let rotated = KeyBundle::generate();
    publish(&server, &rotated);
    assert!(keys.bind_epoch("epoch-1", Some(2.0)).await);
    assert!(!keys.is_loaded().await);

    let got = keys.get_key_for("prefs").await.unwrap();
    assert_eq!(got.as_bytes(), rotated.default_key().as_bytes());
}

#[tokio::test]
async fn invalidate_clears_epoch_and_keys() {
    let server = MemoryBackend::new();
    publish(&server, &KeyBundle::generate());
    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;
    keys.refresh().await.unwrap();

    keys.invalidate().await;
    assert!(!keys.is_loaded().await);
    assert_eq!(keys.epoch().await, None);
    assert!(matches!(
        keys.get_key_for("forms").await,
        Err(SyncError::NotAvailable(_))
    ));
}

#[tokio::test]
async fn undecryptable_bundle_is_reported() {
    let server = MemoryBackend::new();
    let foreign = derive_key("someone else", &Salt::for_account(ACCOUNT), &KdfParams::fast())
        .unwrap();
    server.put_raw("crypto", "keys", &KeyBundle::generate().seal(&foreign).unwrap());

    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;
    assert!(matches!(keys.refresh().await, Err(SyncError::DecryptFailed)));
}

#[tokio::test]
async fn concurrent_readers_see_the_same_key() {
    let server = MemoryBackend::new();
    let bundle = KeyBundle::generate();
    publish(&server, &bundle);
    let keys = manager(&server);
    keys.bind_epoch("epoch-1", None).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            let name = if i % 2 == 0 { "bookmarks" } else { "history" };
            *keys.get_key_for(name).await.unwrap().as_bytes()
        }));
    }

    for handle in handles {
        assert_eq!(&handle.await.unwrap(), bundle.default_key().as_bytes());
    }
    let fetches = server
        .log()
        .iter()
        .filter(|op| op.as_str() == "get crypto/keys")
        .count();
    assert_eq!(fetches, 1);
}
