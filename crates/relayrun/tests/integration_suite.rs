//! End-to-end invocations between a server and a client, over real TCP and
//! over the in-process transport.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use relaynet::BrokerConfig;
use relaynet::LocalTransport;
use relaynet::TcpTransport;
use relaynet::Transport;
use relaynet::transport;
use relayrpc::ErrorKind;
use relayrpc::InterimResponse;
use relayrpc::InvocationId;
use relayrpc::Progress;
use relayrpc::RemoteError;
use relayrpc::ServerBound;
use relayrun::InvocationClient;
use relayrun::InvocationEvent;
use relayrun::InvocationRuntime;
use relayrun::InvocationServer;
use relayrun::client;
use relayrun::handler_fn;
use serde_json::Value;
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn transports() -> Vec<(&'static str, Arc<dyn Transport>)> {
    vec![
        ("tcp", Arc::new(TcpTransport::new())),
        ("local", Arc::new(LocalTransport::new())),
    ]
}

/// A loopback port nothing listens on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    _runtime: InvocationRuntime,
    server: InvocationServer,
    client: InvocationClient,
}

/// A runtime serving the test methods and a client connected to it.
async fn harness(transport: Arc<dyn Transport>) -> Harness {
    init_tracing();
    let runtime = InvocationRuntime::builder()
        .transport(transport)
        .progress_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    let server = runtime.serve(&BrokerConfig::new("jobs")).await.unwrap();
    register_methods(&server);

    let config = BrokerConfig::new("jobs").port(server.local_peer().port());
    let client = runtime.connect(&config).await.unwrap();

    Harness {
        _runtime: runtime,
        server,
        client,
    }
}

fn register_methods(server: &InvocationServer) {
    server
        .register_method(
            "two_steps",
            handler_fn(|ctx, _parameter| async move {
                ctx.callback().interim_data(&json!({"percent": 10}))?;
                ctx.callback().interim_data(&json!({"percent": 50}))?;
                Ok(json!("done"))
            }),
        )
        .unwrap();

    server
        .register_method(
            "fail",
            handler_fn(|_ctx, _parameter| async move { Err(anyhow!("disk full")) }),
        )
        .unwrap();

    server
        .register_method(
            "echo",
            handler_fn(|_ctx, parameter| async move { Ok(parameter) }),
        )
        .unwrap();

    server
        .register_method(
            "until_canceled",
            handler_fn(|ctx, _parameter| async move {
                let mut ticks = 0u64;
                loop {
                    ctx.execution().check_canceled()?;
                    ctx.callback().interim_data(&json!({"tick": ticks}))?;
                    ticks += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }),
        )
        .unwrap();

    server
        .register_method(
            "greet",
            handler_fn(|ctx, _parameter| async move {
                let answer = ctx.ask(json!("name?")).await?;
                let name = answer.as_str().unwrap_or("stranger");
                Ok(json!(format!("hello {}", name)))
            }),
        )
        .unwrap();

    server
        .register_method(
            "count",
            handler_fn(|ctx, parameter| async move {
                let steps = parameter.as_u64().unwrap_or(4);
                let execution = ctx.execution();
                execution.set_total_step_count(steps);
                execution.set_description("counting");
                for _ in 0..steps {
                    execution.worked_one();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(json!(steps))
            }),
        )
        .unwrap();

    server
        .register_method(
            "split",
            handler_fn(|ctx, _parameter| async move {
                let execution = ctx.execution();
                execution.set_total_step_count(100);
                let fetch = execution.create_sub_execution(40, false);
                let build = execution.create_sub_execution(60, true);
                fetch.set_total_step_count(3);
                build.set_total_step_count(7);
                for _ in 0..3 {
                    fetch.worked_one();
                }
                for _ in 0..7 {
                    build.worked_one();
                }
                Ok(Value::Null)
            }),
        )
        .unwrap();

    server
        .register_method(
            "explode",
            handler_fn(|_ctx, _parameter| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
        )
        .unwrap();
}

/// Drains an invocation up to and including its terminal event.
async fn drain(invocation: &mut relayrun::Invocation) -> Vec<InvocationEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(WAIT, invocation.next_event())
            .await
            .expect("invocation stalled")
            .expect("stream ended before a terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn last_progress(events: &[InvocationEvent]) -> Option<&Progress> {
    events.iter().rev().find_map(|event| match event {
        InvocationEvent::Interim(InterimResponse::Progress(progress)) => Some(progress),
        _ => None,
    })
}

// --- Test 1: Interim Responses Then Result ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_interims_then_finished() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let mut invocation = h.client.invoke("two_steps", Value::Null);

        let events = drain(&mut invocation).await;
        assert_eq!(
            events,
            vec![
                InvocationEvent::Interim(InterimResponse::Data(json!({"percent": 10}))),
                InvocationEvent::Interim(InterimResponse::Data(json!({"percent": 50}))),
                InvocationEvent::Finished(json!("done")),
            ],
            "over {}",
            name
        );

        let after = timeout(WAIT, invocation.next_event()).await.unwrap();
        assert!(after.is_none(), "over {}: event after terminal", name);
    }
}

// --- Test 2: Handler Error ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_error_is_single_exception() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let mut invocation = h.client.invoke("fail", Value::Null);

        let events = drain(&mut invocation).await;
        assert_eq!(events.len(), 1, "over {}", name);
        match &events[0] {
            InvocationEvent::Exception(e) => {
                assert_eq!(e.kind, ErrorKind::Application);
                assert!(e.message.contains("disk full"));
            }
            other => panic!("over {}: expected exception, got {:?}", name, other),
        }
        assert!(timeout(WAIT, invocation.next_event()).await.unwrap().is_none());
    }
}

// --- Test 3: Unknown Method ---

#[tokio::test]
async fn test_unknown_method() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let result = h.client.invoke("nope", Value::Null).result().await;
        assert!(
            matches!(
                result,
                Err(client::Error::Remote(RemoteError {
                    kind: ErrorKind::MethodNotFound,
                    ..
                }))
            ),
            "over {}: {:?}",
            name,
            result
        );
    }
}

// --- Test 4: Parameters Round Trip ---

#[tokio::test]
async fn test_echo_through_method_proxy() {
    for (_, transport) in transports() {
        let h = harness(transport).await;
        let echo = h.client.method("echo");
        let payload = json!({"list": [1, 2, 3], "nested": {"ok": true}});

        let result = timeout(WAIT, echo.call(&payload)).await.unwrap().unwrap();
        assert_eq!(result, payload);
        assert_eq!(h.client.in_flight(), 0);
    }
}

// --- Test 5: Cancellation ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_after_first_interim() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let mut invocation = h.client.invoke("until_canceled", Value::Null);

        let first = timeout(WAIT, invocation.next_event()).await.unwrap().unwrap();
        assert!(matches!(first, InvocationEvent::Interim(_)), "over {}", name);
        invocation.cancel();

        let events = drain(&mut invocation).await;
        match events.last() {
            Some(InvocationEvent::Exception(e)) => assert_eq!(e.kind, ErrorKind::Canceled),
            other => panic!("over {}: expected canceled, got {:?}", name, other),
        }
        assert!(
            !events.iter().any(|e| matches!(e, InvocationEvent::Finished(_))),
            "over {}",
            name
        );
    }
}

// --- Test 6: Questions ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_question_round_trip() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let mut invocation = h.client.invoke("greet", Value::Null);

        let event = timeout(WAIT, invocation.next_event()).await.unwrap().unwrap();
        let InvocationEvent::Request { request_id, request } = event else {
            panic!("over {}: expected a question, got {:?}", name, event);
        };
        assert_eq!(request, json!("name?"));
        assert_eq!(h.server.question_service().pending(), 1);

        invocation.respond(request_id, json!("relay"));
        let result = timeout(WAIT, invocation.result()).await.unwrap().unwrap();
        assert_eq!(result, json!("hello relay"), "over {}", name);
        assert_eq!(h.server.question_service().pending(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_waiting_for_answer() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let mut invocation = h.client.invoke("greet", Value::Null);

    let event = timeout(WAIT, invocation.next_event()).await.unwrap().unwrap();
    assert!(matches!(event, InvocationEvent::Request { .. }));
    invocation.cancel();

    let events = drain(&mut invocation).await;
    assert_eq!(
        events.last(),
        Some(&InvocationEvent::Exception(RemoteError::canceled()))
    );
    assert_eq!(h.server.question_service().pending(), 0);
}

#[tokio::test]
async fn test_result_refuses_unanswered_question() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let result = timeout(WAIT, h.client.invoke("greet", Value::Null).result())
        .await
        .unwrap();
    assert!(matches!(result, Err(client::Error::UnansweredRequest(_))));
}

// --- Test 7: Progress Reporting ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_final_progress_matches_total() {
    for (name, transport) in transports() {
        let h = harness(transport).await;
        let mut invocation = h.client.invoke("count", json!(6));

        let events = drain(&mut invocation).await;
        assert_eq!(events.last(), Some(&InvocationEvent::Finished(json!(6))));

        let progress = last_progress(&events).expect("no progress reported");
        assert_eq!(progress.total_step_count, 6, "over {}", name);
        assert_eq!(progress.total_worked, 6, "over {}", name);
        assert_eq!(progress.description.as_deref(), Some("counting"));
    }
}

#[tokio::test]
async fn test_sub_executions_fill_root() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let mut invocation = h.client.invoke("split", Value::Null);

    let events = drain(&mut invocation).await;
    let progress = last_progress(&events).expect("no progress reported");
    assert_eq!(progress.total_worked, 100);
    assert_eq!(progress.sub_progress.len(), 2);
    assert!(progress.sub_progress.iter().all(|sub| sub.total_worked == sub.total_step_count));
}

// --- Test 8: Panics ---

#[tokio::test]
async fn test_panic_becomes_exception() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let result = timeout(WAIT, h.client.invoke("explode", Value::Null).result())
        .await
        .unwrap();
    match result {
        Err(client::Error::Remote(e)) => {
            assert_eq!(e.kind, ErrorKind::Panicked);
            assert!(e.message.contains("kaboom"));
        }
        other => panic!("expected panicked, got {:?}", other),
    }
}

// --- Test 9: Unreachable Server ---

#[tokio::test]
async fn test_unreachable_server_is_reported_on_invocation() {
    init_tracing();
    for (name, transport) in transports() {
        let runtime = InvocationRuntime::builder().transport(transport).build().unwrap();
        let port = closed_port();
        let client = runtime
            .connect(&BrokerConfig::new("ghost").port(port))
            .await
            .unwrap();

        let mut invocation = client.invoke("anything", Value::Null);
        let event = timeout(WAIT, invocation.next_event()).await.unwrap();
        assert!(
            matches!(
                event,
                Some(InvocationEvent::Undelivered(transport::Error::ConnectionRefused(_)))
            ),
            "over {}: {:?}",
            name,
            event
        );
        assert!(timeout(WAIT, invocation.next_event()).await.unwrap().is_none());
        assert_eq!(client.in_flight(), 0);
    }
}

// --- Test 10: Concurrency and Cleanup ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_invocations() {
    for (name, transport) in transports() {
        let h = harness(transport).await;

        let calls: Vec<_> = (0..25)
            .map(|i| {
                let echo = h.client.method("echo");
                tokio::spawn(async move { echo.call(&json!(i)).await })
            })
            .collect();

        for (i, call) in calls.into_iter().enumerate() {
            let result = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
            assert_eq!(result, json!(i), "over {}", name);
        }
        assert_eq!(h.client.in_flight(), 0);

        // the server unregisters just after sending the terminal message
        let drained = timeout(WAIT, async {
            while !h.server.cancel_service().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "over {}: invocations left registered", name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_invocation_is_canceled_on_server() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let mut invocation = h.client.invoke("until_canceled", Value::Null);
    let first = timeout(WAIT, invocation.next_event()).await.unwrap();
    assert!(matches!(first, Some(InvocationEvent::Interim(_))));
    assert_eq!(h.client.in_flight(), 1);
    assert_eq!(h.server.cancel_service().len(), 1);

    drop(invocation);
    assert_eq!(h.client.in_flight(), 0);

    let stopped = timeout(WAIT, async {
        while !h.server.cancel_service().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "handler kept running after its handle was dropped");
}

// --- Test 11: Lost Frames ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_interim_does_not_hold_back_result() {
    init_tracing();
    let runtime = InvocationRuntime::builder()
        .transport(Arc::new(TcpTransport::new().max_frame_len(4096)))
        .reorder_grace(Duration::from_millis(50))
        .build()
        .unwrap();
    let server = runtime.serve(&BrokerConfig::new("lossy")).await.unwrap();
    server
        .register_method(
            "big",
            handler_fn(|ctx, _parameter| async move {
                // too large for the wire, dropped after it leaves
                ctx.callback().interim_data(&"x".repeat(8000))?;
                ctx.callback().interim_data(&json!("after"))?;
                Ok(json!("done"))
            }),
        )
        .unwrap();
    let client = runtime
        .connect(&BrokerConfig::new("lossy").port(server.local_peer().port()))
        .await
        .unwrap();

    let mut invocation = client.invoke("big", Value::Null);
    let events = drain(&mut invocation).await;
    assert_eq!(
        events,
        vec![
            InvocationEvent::Interim(InterimResponse::Data(json!("after"))),
            InvocationEvent::Finished(json!("done")),
        ]
    );
    assert!(timeout(WAIT, invocation.next_event()).await.unwrap().is_none());
    assert_eq!(client.in_flight(), 0);

    let result = timeout(WAIT, client.invoke("big", Value::Null).result()).await.unwrap();
    assert_eq!(result, Ok(json!("done")));
}

// --- Test 12: Repeated Invoke ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_invoke_runs_once() {
    let h = harness(Arc::new(LocalTransport::new())).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    h.server
        .register_method(
            "tally",
            handler_fn(move |_ctx, _parameter| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

    let invoke = ServerBound::Invoke {
        invocation_id: InvocationId::random(),
        method: "tally".into(),
        parameter: Value::Null,
    };
    for _ in 0..8 {
        h.client.message_client().send(&invoke, None);
    }

    let settled = timeout(WAIT, async {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if runs.load(Ordering::SeqCst) > 0 && h.server.cancel_service().is_empty() {
                break;
            }
        }
    })
    .await;
    assert!(settled.is_ok());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
