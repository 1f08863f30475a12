//! Integration tests for the in-memory persistence capability.

#![allow(clippy::unwrap_used)]

use safe_persist_core::{
    GuardDecision, GuardedPersistence, Persistence, PersistenceError, PersistenceGuardRegistry,
    PersistenceProvider, ViolationCause, ViolationSlot,
};
use safe_persist_testing::{InMemoryStore, SharedSessionProvider};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_commit_independently() {
    let store = InMemoryStore::new();

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let session = store.acquire();
                session.insert(format!("item-{i}"), format!("{i}"));
                session.persist().await.unwrap()
            })
        })
        .collect();

    for written in futures::future::join_all(handles).await {
        assert_eq!(written.unwrap(), 1);
    }

    assert_eq!(store.len(), 32);
    assert_eq!(store.commits(), 32);
    assert_eq!(store.sessions_opened(), 32);
}

#[tokio::test]
async fn test_guarded_session_blocks_forbidden_persist() {
    let store = InMemoryStore::new();
    let registry = PersistenceGuardRegistry::new();
    let session = store.acquire();
    let _registration = registry.register(&session, GuardDecision::FORBID).unwrap();

    let violations = ViolationSlot::new();
    let guarded = GuardedPersistence::new(
        Arc::clone(&session),
        GuardDecision::FORBID,
        registry.clone(),
        violations.clone(),
    );

    session.insert("k", "v");
    let err = guarded.persist().await.unwrap_err();

    assert!(matches!(err, PersistenceError::Violation(_)));
    assert_eq!(violations.first().map(|v| v.cause()), Some(ViolationCause::Forbidden));
    assert!(store.is_empty());
    assert_eq!(session.persist_calls(), 0);
}

#[tokio::test]
async fn test_guarded_session_allows_permitted_persist() {
    let store = InMemoryStore::new();
    let registry = PersistenceGuardRegistry::new();
    let session = store.acquire();
    let _registration = registry.register(&session, GuardDecision::PERMIT).unwrap();

    let guarded = GuardedPersistence::new(
        Arc::clone(&session),
        GuardDecision::PERMIT,
        registry,
        ViolationSlot::new(),
    );

    session.insert("k", "v");
    assert_eq!(guarded.persist().await.unwrap(), 1);
    assert_eq!(store.get("k"), Some("v".to_string()));
}

#[test]
fn test_shared_session_conflicts_across_decisions() {
    let store = InMemoryStore::new();
    let provider = SharedSessionProvider::new(&store);
    let registry = PersistenceGuardRegistry::new();

    let first = registry.register(&provider.acquire(), GuardDecision::PERMIT).unwrap();
    let again = registry.register(&provider.acquire(), GuardDecision::PERMIT).unwrap();
    assert_eq!(registry.len(), 1);

    assert!(registry.register(&provider.acquire(), GuardDecision::FORBID).is_err());

    drop(first);
    drop(again);
    assert!(registry.is_empty());
    assert!(registry.register(&provider.acquire(), GuardDecision::FORBID).is_ok());
}
