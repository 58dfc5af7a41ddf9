//! Configuration errors surface from builders and registries immediately.

use std::sync::Arc;

use relaynet::BrokerConfig;
use relaynet::BrokerId;
use relaynet::LocalTransport;
use relaynet::Side;
use relaynet::broker;
use relaynet::channel;
use relaynet::peer;
use relayrun::InvocationRuntime;
use relayrun::handler_fn;
use relayrun::runtime;
use relayrun::server;

fn local_runtime() -> InvocationRuntime {
    InvocationRuntime::builder()
        .transport(Arc::new(LocalTransport::new()))
        .max_inflight_sends(8)
        .build()
        .unwrap()
}

// --- Builder ---

#[tokio::test]
async fn test_builder_requires_transport() {
    let result = InvocationRuntime::builder().build();
    assert!(matches!(result, Err(runtime::Error::MissingTransport)));
}

#[test]
fn test_builder_requires_runtime_handle() {
    let result = InvocationRuntime::builder()
        .transport(Arc::new(LocalTransport::new()))
        .build();
    assert!(matches!(
        result,
        Err(runtime::Error::Channel(channel::Error::NoRuntime))
    ));
}

#[test]
fn test_builder_accepts_explicit_handle() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let runtime = InvocationRuntime::builder()
        .transport(Arc::new(LocalTransport::new()))
        .handle(rt.handle().clone())
        .build()
        .unwrap();
    assert_eq!(runtime.config().max_inflight_sends, None);
}

// --- Brokers ---

#[tokio::test]
async fn test_serving_twice_is_rejected() {
    let runtime = local_runtime();
    runtime.serve(&BrokerConfig::new("solo")).await.unwrap();

    let again = runtime.serve(&BrokerConfig::new("solo")).await;
    assert!(matches!(
        again,
        Err(runtime::Error::Broker(broker::Error::DuplicateBroker(_, Side::Server)))
    ));
}

#[tokio::test]
async fn test_connecting_twice_is_rejected() {
    let runtime = local_runtime();
    let server = runtime.serve(&BrokerConfig::new("pair")).await.unwrap();
    let config = BrokerConfig::new("pair").port(server.local_peer().port());

    runtime.connect(&config).await.unwrap();
    let again = runtime.connect(&config).await;
    assert!(matches!(
        again,
        Err(runtime::Error::Broker(broker::Error::DuplicateBroker(_, Side::Client)))
    ));
}

#[tokio::test]
async fn test_connect_rejects_unbound_server_port() {
    let runtime = local_runtime();
    let result = runtime.connect(&BrokerConfig::new("nowhere")).await;
    assert!(matches!(
        result,
        Err(runtime::Error::Broker(broker::Error::Channel(channel::Error::InvalidPeer {
            reason: peer::Error::UnboundPort,
            ..
        })))
    ));
}

#[tokio::test]
async fn test_lookups() {
    let runtime = local_runtime();
    let id = BrokerId::from("lookup");
    assert!(matches!(
        runtime.server(&id),
        Err(runtime::Error::UnknownBroker(_, Side::Server))
    ));

    let server = runtime.serve(&BrokerConfig::new("lookup")).await.unwrap();
    assert_eq!(runtime.server(&id).unwrap().local_peer(), server.local_peer());
    assert!(matches!(
        runtime.client(&id),
        Err(runtime::Error::UnknownBroker(_, Side::Client))
    ));

    runtime.shutdown(&id);
    assert!(runtime.server(&id).is_err());
    runtime.serve(&BrokerConfig::new("lookup")).await.unwrap();
}

// --- Methods ---

#[tokio::test]
async fn test_duplicate_method_is_rejected() {
    let runtime = local_runtime();
    let server = runtime.serve(&BrokerConfig::new("methods")).await.unwrap();
    let handler = handler_fn(|_ctx, parameter| async move { Ok(parameter) });

    server.register_method("same", handler.clone()).unwrap();
    assert_eq!(
        server.register_method("same", handler.clone()),
        Err(server::Error::DuplicateMethod("same".into()))
    );

    assert!(server.unregister_method("same"));
    server.register_method("same", handler).unwrap();
}
