//! SDK 门面测试

use std::sync::Arc;

use fieldline_sdk::net::MockConnector;
use fieldline_sdk::prelude::*;

#[test]
fn test_init_logging_is_repeatable() {
    fieldline_sdk::init_logging();
    fieldline_sdk::init_logging_with("debug");
    tracing::info!("logging initialised twice");
}

#[test]
fn test_prelude_builds_fleet() {
    let fleet = FleetManager::builder()
        .config(FleetConfig::default())
        .connector(Arc::new(MockConnector::new()))
        .callbacks(Arc::new(NoopCallbacks))
        .build()
        .unwrap();
    assert_eq!(fleet.expected_count(), 0);
    assert!(!fleet.is_streaming());
    fleet.shutdown();
}
