//! Behaviour every `KeyStoreRepository` backend must share.
//!
//! Each function takes freshly opened repositories over empty storage.

use super::sample_store;
use chrono::Utc;
use sts_keymanagement::{KeyError, KeyState, KeyStoreRepository, KeyUsage, SealedKeyStoreCodec};

/// `load` of an unknown keystore reports `NotFound`, and `exists` is false.
pub async fn missing_keystore_is_not_found(repo: &dyn KeyStoreRepository) {
    assert!(!repo.exists("absent").await.unwrap());
    let err = repo.load("absent").await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
    let err = repo.load_attributes("absent").await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
    let err = repo.last_update("absent").await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
}

/// A saved keystore loads back with identical aliases, attributes and material.
pub async fn save_then_load_round_trips(repo: &dyn KeyStoreRepository) {
    let store = sample_store("round-trip");
    repo.save(&store).await.unwrap();

    let loaded = repo.load("round-trip").await.unwrap();
    assert_eq!(loaded.name(), "round-trip");
    assert_eq!(loaded.store_type(), SealedKeyStoreCodec::STORE_TYPE);
    assert!(loaded.same_entries(&store));
    for original in store.entries() {
        let reloaded = loaded.entry(original.alias()).unwrap();
        assert_eq!(reloaded.attributes(), original.attributes());
        assert_eq!(reloaded.material().expose(), original.material().expose());
        assert_eq!(reloaded.material().kind(), original.material().kind());
        assert_eq!(reloaded.material().algorithm(), original.material().algorithm());
    }
    assert!(repo.exists("round-trip").await.unwrap());
}

/// The repository stamps `last_update` with the persistence instant it returns.
pub async fn save_sets_last_update(repo: &dyn KeyStoreRepository) {
    let store = sample_store("stamped");
    let before = Utc::now();
    let persisted_at = repo.save(&store).await.unwrap();
    let after = Utc::now();
    assert!(persisted_at >= before && persisted_at <= after);

    let loaded = repo.load("stamped").await.unwrap();
    assert_eq!(loaded.last_update(), persisted_at);
    assert_eq!(repo.last_update("stamped").await.unwrap(), persisted_at);

    let second = repo.save(&loaded).await.unwrap();
    assert!(second >= persisted_at);
    assert_eq!(repo.load("stamped").await.unwrap().last_update(), second);
}

/// `save` replaces every entry of an existing keystore.
pub async fn save_replaces_entries(repo: &dyn KeyStoreRepository) {
    let store = sample_store("replaced");
    repo.save(&store).await.unwrap();

    let kept: Vec<_> = store
        .entries()
        .filter(|e| e.key_usage() != KeyUsage::SecretKey)
        .cloned()
        .map(|e| e.into_legacy(Utc::now()))
        .collect();
    let updated = store.with_entries(kept);
    repo.save(&updated).await.unwrap();

    let loaded = repo.load("replaced").await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.entry("sts-sec-1").is_none());
    assert_eq!(loaded.entry("sts-sig-1").unwrap().state(), KeyState::Legacy);
    assert!(loaded.same_entries(&updated));
}

/// `create` refuses to overwrite and leaves the first keystore intact.
pub async fn create_is_conditional(repo: &dyn KeyStoreRepository) {
    let store = sample_store("created");
    repo.create(&store).await.unwrap();

    let other = store.with_entries(Vec::new());
    let err = repo.create(&other).await.unwrap_err();
    assert!(err.is_already_exists(), "expected AlreadyExists, got {err:?}");

    let loaded = repo.load("created").await.unwrap();
    assert!(loaded.same_entries(&store));
}

/// Attributes are readable without the key material.
pub async fn load_attributes_matches_entries(repo: &dyn KeyStoreRepository) {
    let store = sample_store("attributes");
    repo.save(&store).await.unwrap();

    let attributes = repo.load_attributes("attributes").await.unwrap();
    assert_eq!(attributes, store.attributes());
}

/// Opening stored data with the wrong password is `Corruption`.
pub async fn wrong_password_is_corruption(
    repo: &dyn KeyStoreRepository,
    wrong: &dyn KeyStoreRepository,
) {
    repo.save(&sample_store("locked")).await.unwrap();

    let err = wrong.load("locked").await.unwrap_err();
    assert!(err.is_fatal(), "expected a fatal error, got {err:?}");
    assert!(matches!(err.root(), KeyError::Corruption(_)));

    // Metadata stays readable without the password
    assert_eq!(wrong.load_attributes("locked").await.unwrap().len(), 3);
    assert!(repo.load("locked").await.is_ok());
}

/// Different keystore names never see each other's entries.
pub async fn keystores_are_isolated(repo: &dyn KeyStoreRepository) {
    let first = sample_store("first");
    let second = sample_store("second").with_entries(Vec::new());
    repo.save(&first).await.unwrap();
    repo.save(&second).await.unwrap();

    assert_eq!(repo.load("first").await.unwrap().len(), 3);
    assert!(repo.load("second").await.unwrap().is_empty());
}

/// Names that differ only in a separator character address different keystores
pub async fn separator_variants_are_isolated(repo: &dyn KeyStoreRepository) {
    repo.save(&sample_store("tenant/a")).await.unwrap();

    for other in ["tenant_a", "tenant\\a", "tenant_2Fa"] {
        assert!(!repo.exists(other).await.unwrap(), "{other}");
        assert!(repo.load(other).await.unwrap_err().is_not_found(), "{other}");
    }

    repo.save(&sample_store("tenant_a").with_entries(Vec::new()))
        .await
        .unwrap();
    assert_eq!(repo.load("tenant/a").await.unwrap().len(), 3);
    let sibling = repo.load("tenant_a").await.unwrap();
    assert_eq!(sibling.name(), "tenant_a");
    assert!(sibling.is_empty());
}
