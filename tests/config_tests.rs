//! Loading engine and binding configuration from JSON.

use std::collections::BTreeSet;

use pollcoalesce::{BindingConfig, Completion, EngineConfig, QueryRequest, QueryServer};

#[test]
fn partial_engine_config_keeps_defaults() {
    let config: EngineConfig = serde_json::from_str(
        r#"{
            "debounce_ms": 25,
            "offload_dispatch": true,
            "wait_queue_capacity": 64
        }"#,
    )
    .unwrap();

    let defaults = EngineConfig::default();
    assert_eq!(config.debounce_ms, 25);
    assert!(config.offload_dispatch);
    assert_eq!(config.wait_queue_capacity, Some(64));
    assert_eq!(config.default_timeout_ms, 5000);
    assert_eq!(config.execution_queue, 2);
    assert_eq!(config.dispatch_workers, 3);
    assert_eq!(config.completion_queue, 20);
    assert_eq!(config.completion_keep_alive_ms, 30_000);
    assert_eq!(config.completion_max_workers, defaults.completion_max_workers);
}

#[test]
fn empty_engine_config_is_default() {
    let config: EngineConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.debounce().as_millis(), 10);
    assert_eq!(config.default_timeout().as_secs(), 5);
}

#[test]
fn bindings_load_from_json() {
    let config: BindingConfig = serde_json::from_str(
        r#"{
            "bindings": {
                "QUERY_FLIGHT": ["FLIGHT_LIST", "FLIGHT_BOARD"],
                "QUERY_GATE": ["GATE_LIST"]
            }
        }"#,
    )
    .unwrap();

    assert_eq!(config.bindings.len(), 2);

    let server = QueryServer::<Vec<String>>::builder()
        .templates(config)
        .build()
        .unwrap();

    let handle = server
        .register_request(
            QueryRequest::new("FLIGHT_BOARD")
                .param("7")
                .supplier(|| Ok(vec!["board".to_owned()])),
        )
        .unwrap();
    assert_eq!(handle.wait(), Completion::Fulfilled(vec!["board".to_owned()]));

    assert_eq!(
        server.registry().views_for_action("QUERY_FLIGHT::7").as_deref(),
        Some(&BTreeSet::from([
            "FLIGHT_BOARD::7".to_owned(),
            "FLIGHT_LIST::7".to_owned()
        ]))
    );
}
