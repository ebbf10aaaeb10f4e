//! A bridge built from a TOML file, persisting to SQLite.

use crate::helpers::{Phone, WAIT, test_config, wait_until};
use voxbridge::config::{LlmBackend, StoreBackend, SttBackend, TtsBackend};
use voxbridge::sip::CallState;
use voxbridge::store::SqliteStore;
use voxbridge::{BridgeConfig, BridgeError, BridgeServer};

#[tokio::test]
async fn file_config_bridge_writes_sqlite_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.stt.backend = SttBackend::Scripted;
    cfg.tts.backend = TtsBackend::Scripted;
    cfg.llm.backend = LlmBackend::Scripted;
    cfg.store.backend = StoreBackend::Sqlite;
    cfg.store.path = dir.path().join("calls.db");
    let config_path = dir.path().join("config.toml");
    cfg.save_to_file(&config_path).unwrap();

    let loaded = BridgeConfig::from_file(&config_path).unwrap();
    assert_eq!(loaded.schemes.len(), 5);
    let bridge = BridgeServer::from_config(loaded).unwrap().start().await.unwrap();
    let manager = bridge.manager();
    let phone = Phone::new(bridge.sip_addr()).await;

    let ok = phone.call("db-1", "100").await;
    assert!(wait_until(WAIT, || manager.handler("db-1").is_some()).await);
    phone.hang_up("db-1", &ok).await;
    bridge.shutdown().await.unwrap();

    let store = SqliteStore::open(&dir.path().join("calls.db")).unwrap();
    let call = store.find_call("db-1").await.unwrap().unwrap();
    assert_eq!(call.status, CallState::Ended);
    assert_eq!(call.caller, "alice");
    assert_eq!(call.called, "100");
    assert!(call.answered_at.is_some());
    assert!(call.ended_at.is_some());
}

#[tokio::test]
async fn invalid_config_is_refused_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.stt.chunk_ms = 30;
    let result = BridgeServer::from_config(cfg);
    assert!(matches!(result, Err(BridgeError::Config(_))));
}
