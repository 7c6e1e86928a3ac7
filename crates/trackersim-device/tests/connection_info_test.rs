//! Connection info resolution and cache tests.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use trackersim_device::{ConnectionInfo, ConnectionInfoCache, ConnectionInfoResolver, InfoSource};

fn resolver(dir: &std::path::Path, cloud: &Arc<MockCloud>) -> ConnectionInfoResolver {
    ConnectionInfoResolver::new(
        cloud.clone(),
        ConnectionInfoCache::new(dir, DEVICE_ID),
        DEVICE_ID,
    )
}

#[tokio::test]
async fn test_shadow_topics_preferred() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new().with_device(json!({
        "state": {"desired": {"pairing": {"topics": {
            "d2c": "prod/x/m/d/device123/d2c",
            "c2d": "prod/x/m/d/device123/+/r"
        }}}}
    })));

    let (info, source) = resolver(dir.path(), &cloud).resolve().await.unwrap();

    assert_eq!(source, InfoSource::Shadow);
    assert_eq!(info.mqtt_host, "mqtt.example.test");
    assert_eq!(info.topic_d2c, "prod/x/m/d/device123/d2c");
}

#[tokio::test]
async fn test_fallback_when_shadow_has_no_topics() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new());

    let (info, source) = resolver(dir.path(), &cloud).resolve().await.unwrap();

    assert_eq!(source, InfoSource::Fallback);
    assert_eq!(info.topic_d2c, "prod/tenant-1/m/d/device123/d2c");
    assert_eq!(info.topic_c2d, "prod/tenant-1/m/d/device123/+/r");
}

#[tokio::test]
async fn test_round_trip_reuses_cache_without_backend() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new());

    let (first, _) = resolver(dir.path(), &cloud).resolve().await.unwrap();
    assert_eq!(cloud.backend_calls(), 2);

    // a fresh run reads the file written by the first one
    let (second, source) = resolver(dir.path(), &cloud).resolve().await.unwrap();
    assert_eq!(source, InfoSource::Cache);
    assert_eq!(second, first);
    assert_eq!(cloud.backend_calls(), 2);

    let cached = std::fs::read_to_string(dir.path().join("device123.mqtt_info.json")).unwrap();
    let raw: serde_json::Value = serde_json::from_str(&cached).unwrap();
    assert_eq!(raw["mqtt_host"], "mqtt.example.test");
    assert!(raw["topic_d2c"].is_string());
    assert!(raw["topic_c2d"].is_string());
}

#[tokio::test]
async fn test_incomplete_cache_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new());
    ConnectionInfoCache::new(dir.path(), DEVICE_ID)
        .save(&ConnectionInfo {
            mqtt_host: "old.example.test".to_string(),
            topic_d2c: String::new(),
            topic_c2d: "old/+/r".to_string(),
        })
        .await
        .unwrap();

    let (info, source) = resolver(dir.path(), &cloud).resolve().await.unwrap();

    assert_eq!(source, InfoSource::Fallback);
    assert_eq!(info.mqtt_host, "mqtt.example.test");
    assert!(info.is_valid());
}

#[tokio::test]
async fn test_backend_error_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new().with_device_status(404));

    let err = resolver(dir.path(), &cloud).resolve().await.unwrap_err();
    assert!(err.is_not_found());
    assert!(ConnectionInfoCache::new(dir.path(), DEVICE_ID)
        .load()
        .await
        .is_none());
}
