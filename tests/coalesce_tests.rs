//! These tests ensure that actions are executed the correct number of times,
//! and that every waiting request gets a result it is allowed to see.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use futures::executor;
use pollcoalesce::{
    BindingMap, Completion, EngineConfig, Error, QueryRequest, QueryServer, StatsSnapshot,
};

fn flight_templates() -> BindingMap {
    BTreeMap::from([(
        "QUERY_FLIGHT".to_owned(),
        BTreeSet::from(["FLIGHT_LIST".to_owned(), "FLIGHT_BOARD".to_owned()]),
    )])
}

fn flights() -> Vec<String> {
    vec!["1".to_owned(), "2".to_owned()]
}

fn server(config: EngineConfig) -> QueryServer<Vec<String>> {
    QueryServer::builder()
        .config(config)
        .templates(flight_templates())
        .build()
        .unwrap()
}

fn debounced(millis: u64) -> EngineConfig {
    EngineConfig {
        debounce_ms: millis,
        ..EngineConfig::default()
    }
}

type Flights = anyhow::Result<Vec<String>>;

fn call_counter(
    counter: &Arc<AtomicUsize>,
    function: impl Fn() -> Flights + Send + Sync + 'static,
) -> impl Fn() -> Flights + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        function()
    }
}

#[test]
fn requests_in_one_window_share_an_execution() {
    let server = server(debounced(50));
    let counter = Arc::new(AtomicUsize::new(0));

    let first = server
        .register_request(
            QueryRequest::new("FLIGHT_LIST").supplier(call_counter(&counter, || Ok(flights()))),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(5));
    let second = server
        .register_request(
            QueryRequest::new("FLIGHT_LIST").supplier(call_counter(&counter, || Ok(flights()))),
        )
        .unwrap();

    assert_eq!(executor::block_on(first), Completion::Fulfilled(flights()));
    assert_eq!(executor::block_on(second), Completion::Fulfilled(flights()));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let bindings = server.registry().actions();
    assert_eq!(
        bindings.get("QUERY_FLIGHT"),
        Some(&BTreeSet::from([
            "FLIGHT_BOARD".to_owned(),
            "FLIGHT_LIST".to_owned()
        ]))
    );

    // The second trigger finds nothing left to do.
    thread::sleep(Duration::from_millis(150));
    let StatsSnapshot {
        executions_run,
        executions_skipped,
        requests_completed,
        ..
    } = server.stats();
    assert_eq!(executions_run, 1);
    assert_eq!(executions_skipped, 1);
    assert_eq!(requests_completed, 2);
}

#[test]
fn concurrent_requests_share_an_execution() {
    let server = server(debounced(200));
    let counter = Arc::new(AtomicUsize::new(0));

    let results: Vec<Completion<Vec<String>>> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let server = &server;
                let counter = &counter;
                let view = if i % 2 == 0 { "FLIGHT_LIST" } else { "FLIGHT_BOARD" };
                s.spawn(move |_| {
                    let handle = server
                        .register_request(
                            QueryRequest::new(view).supplier(call_counter(counter, || Ok(flights()))),
                        )
                        .unwrap();
                    handle.wait()
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap();

    assert_eq!(results.len(), 8);
    assert!(results
        .into_iter()
        .all(|result| result == Completion::Fulfilled(flights())));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(server.execution_lanes(), 1);
}

#[test]
fn request_during_execution_waits_for_the_next_one() {
    let server = server(debounced(10));
    let version = Arc::new(AtomicUsize::new(0));

    let slow_version = || {
        let version = Arc::clone(&version);
        move || -> Flights {
            thread::sleep(Duration::from_millis(100));
            Ok(vec![(version.fetch_add(1, Ordering::SeqCst) + 1).to_string()])
        }
    };

    let before = server
        .register_request(QueryRequest::new("FLIGHT_LIST").supplier(slow_version()))
        .unwrap();

    // Land in the middle of the first execution.
    thread::sleep(Duration::from_millis(40));
    let during = server
        .register_request(QueryRequest::new("FLIGHT_BOARD").supplier(slow_version()))
        .unwrap();

    assert_eq!(before.wait(), Completion::Fulfilled(vec!["1".to_owned()]));
    assert_eq!(during.wait(), Completion::Fulfilled(vec!["2".to_owned()]));
    assert_eq!(version.load(Ordering::SeqCst), 2);
}

#[test]
fn unbound_view_gets_its_own_action() {
    let server = server(EngineConfig::default());

    let handle = server
        .register_request(
            QueryRequest::new("NEW_VIEW")
                .param("42")
                .function(|param| Ok(vec![param.unwrap_or_default().to_owned()])),
        )
        .unwrap();

    assert_eq!(handle.wait(), Completion::Fulfilled(vec!["42".to_owned()]));
    assert_eq!(
        server.registry().views_for_action("Q_NEW_VIEW::42").as_deref(),
        Some(&BTreeSet::from(["NEW_VIEW::42".to_owned()]))
    );
    assert_eq!(
        server.registry().action_for_view("NEW_VIEW::42").as_deref(),
        Some("Q_NEW_VIEW::42")
    );
}

#[test]
fn parameters_keep_actions_apart() {
    let server = server(debounced(30));
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = ["1", "2"]
        .iter()
        .map(|param| {
            server
                .register_request(
                    QueryRequest::new("FLIGHT_LIST")
                        .param(*param)
                        .function(call_counter_with_param(&counter)),
                )
                .unwrap()
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|handle| handle.wait()).collect();
    assert_eq!(
        results,
        [
            Completion::Fulfilled(vec!["1".to_owned()]),
            Completion::Fulfilled(vec!["2".to_owned()]),
        ]
    );
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(server.execution_lanes(), 2);
}

fn call_counter_with_param(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(Option<&str>) -> Flights + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |param: Option<&str>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(param.into_iter().map(str::to_owned).collect())
    }
}

#[test]
fn missing_view_code_runs_immediately() {
    let server = server(EngineConfig::default());

    let handle = server
        .register_request(QueryRequest::new("").supplier(|| Ok(flights())))
        .unwrap();

    // Already complete: nothing was queued or scheduled.
    assert_eq!(handle.try_outcome(), Some(Completion::Fulfilled(flights())));
    assert_eq!(server.registry().queue_count(), 0);
    assert_eq!(server.execution_lanes(), 0);
    assert_eq!(server.stats().fallback_executions, 1);
}

#[test]
fn execution_failure_reaches_every_waiter() {
    let server = server(debounced(30));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            server
                .register_request(
                    QueryRequest::new("BROKEN")
                        .supplier(|| Err(anyhow::anyhow!("backend down"))),
                )
                .unwrap()
        })
        .collect();

    for handle in handles {
        assert_eq!(
            handle.wait(),
            Completion::Errored(Error::Execution {
                action: "Q_BROKEN".to_owned(),
                message: "backend down".to_owned(),
            })
        );
    }
    assert_eq!(server.stats().executions_failed, 1);
}

#[test]
fn invalid_requests_are_rejected() {
    let server = server(EngineConfig::default());

    let neither = server.register_request(QueryRequest::new("FLIGHT_LIST"));
    assert!(matches!(neither, Err(Error::InvalidRequest(..))));

    let both = server.register_request(
        QueryRequest::new("FLIGHT_LIST")
            .supplier(|| Ok(flights()))
            .function(|_| Ok(flights())),
    );
    assert!(matches!(both, Err(Error::InvalidRequest(..))));

    let unsubmitted = server.register_request(
        QueryRequest::new("FLIGHT_LIST")
            .submitted_at(None)
            .supplier(|| Ok(flights())),
    );
    assert!(matches!(unsubmitted, Err(Error::InvalidRequest(..))));

    // Rejected requests never touch the registry.
    assert!(server.registry().actions().is_empty());
}

#[test]
fn full_wait_queue_fails_the_request() {
    let server = server(EngineConfig {
        debounce_ms: 100,
        wait_queue_capacity: Some(1),
        ..EngineConfig::default()
    });

    let accepted = server
        .register_request(QueryRequest::new("FLIGHT_LIST").supplier(|| Ok(flights())))
        .unwrap();
    let rejected = server
        .register_request(QueryRequest::new("FLIGHT_LIST").supplier(|| Ok(flights())))
        .unwrap();

    assert_eq!(
        rejected.try_outcome(),
        Some(Completion::Errored(Error::EnqueueFailed {
            view: "FLIGHT_LIST".to_owned()
        }))
    );
    assert_eq!(accepted.wait(), Completion::Fulfilled(flights()));
}

#[test]
fn offloaded_dispatch_delivers_results() {
    let server = server(EngineConfig {
        offload_dispatch: true,
        ..debounced(30)
    });

    let list = server
        .register_request(QueryRequest::new("FLIGHT_LIST").supplier(|| Ok(flights())))
        .unwrap();
    let board = server
        .register_request(QueryRequest::new("FLIGHT_BOARD").supplier(|| Ok(flights())))
        .unwrap();

    assert_eq!(list.wait(), Completion::Fulfilled(flights()));
    assert_eq!(board.wait(), Completion::Fulfilled(flights()));
}

#[test]
fn empty_templates_are_a_config_error() {
    let built = QueryServer::<Vec<String>>::builder()
        .templates(BindingMap::new())
        .build();

    assert!(matches!(built, Err(Error::Config(..))));
}

#[test]
fn nul_in_param_is_still_served() {
    let server = server(debounced(10));

    let unbound = server
        .register_request(
            QueryRequest::new("NEW_VIEW")
                .param("a\0b")
                .function(|param| Ok(vec![param.unwrap_or_default().to_owned()])),
        )
        .unwrap();
    let bound = server
        .register_request(
            QueryRequest::new("FLIGHT_LIST")
                .param("a\0b")
                .supplier(|| Ok(flights())),
        )
        .unwrap();

    assert_eq!(unbound.wait(), Completion::Fulfilled(vec!["a\0b".to_owned()]));
    assert_eq!(bound.wait(), Completion::Fulfilled(flights()));
}

#[test]
fn panicking_execution_fails_its_waiters_and_the_action_recovers() {
    let server = server(debounced(10));

    let panicked = server
        .register_request(QueryRequest::new("FLIGHT_LIST").supplier(|| -> Flights {
            panic!("backend client poisoned")
        }))
        .unwrap();
    assert_eq!(
        panicked.wait(),
        Completion::Errored(Error::Execution {
            action: "QUERY_FLIGHT".to_owned(),
            message: "panicked: backend client poisoned".to_owned(),
        })
    );

    let healthy = server
        .register_request(QueryRequest::new("FLIGHT_BOARD").supplier(|| Ok(flights())))
        .unwrap();
    assert_eq!(healthy.wait(), Completion::Fulfilled(flights()));

    let stats = server.stats();
    assert_eq!(stats.executions_run, 2);
    assert_eq!(stats.executions_failed, 1);
}

#[test]
fn panicking_fallback_execution_fails_the_request() {
    let server = server(EngineConfig::default());

    let handle = server
        .register_request(QueryRequest::new("").supplier(|| -> Flights { panic!("no view") }))
        .unwrap();

    assert_eq!(
        handle.try_outcome(),
        Some(Completion::Errored(Error::Execution {
            action: String::new(),
            message: "panicked: no view".to_owned(),
        }))
    );
}
