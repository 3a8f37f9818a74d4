//! Integration tests for loading templates and applying updates.

use confsync::core::{ConfigTemplate, PropertyType};
use confsync::prelude::*;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const TEMPLATE: &str = r#"
version: v1
configuration:
  - id: app
    name: Application
    properties:
      - id: port
        type: number
        default: 3000
      - id: debug
        type: boolean
        default: false
      - id: name
        type: string
        default: billing
  - id: db
    properties:
      - id: pool_size
        type: number
        default: 10
"#;

fn store() -> ConfigStore {
    ConfigStore::from_yaml(TEMPLATE).unwrap()
}

#[test]
fn test_load_template_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("confsync.config.yml");
    fs::write(&path, TEMPLATE).unwrap();

    let template = ConfigTemplate::from_path(&path).unwrap();
    assert_eq!(template.raw_content(), TEMPLATE);
    assert_eq!(template.groups().len(), 2);

    let ids: Vec<_> = template.properties().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["app.port", "app.debug", "app.name", "db.pool_size"]);
    assert_eq!(template.properties()[1].property_type, PropertyType::Boolean);

    let store = ConfigStore::load(&template);
    assert_eq!(store.version(), 0);
    assert_eq!(store.get("db.pool_size"), Some(TypedValue::Number(10.0)));
}

#[test]
fn test_missing_template_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = ConfigTemplate::from_path(temp_dir.path().join("nope.yml"));
    assert!(matches!(result, Err(ConfigError::MissingTemplate(_))));
}

#[test]
fn test_number_update_reports_old_and_new() {
    let store = store();
    let changes = store.apply_update([("app.port", "4000")]);

    assert_eq!(changes.len(), 1);
    assert_eq!(changes["app.port"].old_value, TypedValue::Number(3000.0));
    assert_eq!(changes["app.port"].new_value, TypedValue::Number(4000.0));
    assert_eq!(store.get("app.port"), Some(TypedValue::Number(4000.0)));
    assert_eq!(store.version(), 1);
}

#[test]
fn test_unknown_property_is_dropped() {
    let store = store();
    let changes = store.apply_update([("app.unknown", "1")]);

    assert!(changes.is_empty());
    assert_eq!(store.version(), 0);
    assert!(!store.current_raw().contains_key("app.unknown"));
    assert_eq!(store.get("app.unknown"), None);
}

#[test]
fn test_identical_update_is_silent() {
    let store = store();
    let notified = Arc::new(Mutex::new(0));
    let counter = notified.clone();
    let _handle = store.subscribe(move |_| *counter.lock() += 1);

    assert!(store.apply_update([("app.port", "3000"), ("app.name", "billing")]).is_empty());
    assert_eq!(*notified.lock(), 0);

    store.apply_update([("app.port", "3001")]);
    assert!(store.apply_update([("app.port", "3001")]).is_empty());
    assert_eq!(*notified.lock(), 1);
}

#[test]
fn test_unparsable_number_reads_as_nan() {
    let store = store();
    let changes = store.apply_update([("app.port", "not-a-number")]);

    assert_eq!(changes.len(), 1);
    match store.get("app.port") {
        Some(TypedValue::Number(n)) => assert!(n.is_nan()),
        other => panic!("unexpected value: {other:?}"),
    }
    assert_eq!(store.get_raw("app.port").as_deref(), Some("not-a-number"));
}

#[test]
fn test_typed_view_matches_accepted_values() {
    let store = store();
    store.apply_update([
        ("app.debug", "true"),
        ("app.name", "payments"),
        ("db.pool_size", "25"),
        ("db.unknown", "x"),
    ]);

    let typed = store.current_typed();
    assert_eq!(typed.len(), 4);
    assert_eq!(typed["app.port"], TypedValue::Number(3000.0));
    assert_eq!(typed["app.debug"], TypedValue::Boolean(true));
    assert_eq!(typed["app.name"], TypedValue::String("payments".into()));
    assert_eq!(typed["db.pool_size"], TypedValue::Number(25.0));
}

#[test]
fn test_listeners_run_in_order_with_change_set() {
    let store = store();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = seen.clone();
    let _a = store.subscribe(move |update| {
        first.lock().push(("first", update.changes.keys().cloned().collect::<Vec<_>>()));
    });
    let second = seen.clone();
    let _b = store.subscribe(move |update| {
        second.lock().push(("second", update.changes.keys().cloned().collect::<Vec<_>>()));
    });

    store.apply_update([("app.debug", "true"), ("app.port", "3000")]);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("first", vec!["app.debug".to_string()]));
    assert_eq!(seen[1], ("second", vec!["app.debug".to_string()]));
}

#[test]
fn test_dropped_handle_stops_notifications() {
    let store = store();
    let notified = Arc::new(Mutex::new(0));
    let counter = notified.clone();
    let handle = store.subscribe(move |_| *counter.lock() += 1);

    store.apply_update([("app.port", "1")]);
    drop(handle);
    store.apply_update([("app.port", "2")]);

    assert_eq!(*notified.lock(), 1);
    assert_eq!(store.subscriber_count(), 0);
}
