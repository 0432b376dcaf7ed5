//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test broker_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but Docker must be available.

mod common;

use std::sync::Arc;
use std::time::Duration;

use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio_util::sync::CancellationToken;
use warren::config::AmqpConfig;
use warren::transport::AmqpConnection;
use warren::{
    BroadcastHandler, BrokerAdmin, Connection, Emitter, Error, HandlerError, PumpEvent,
    QueueHandler, RpcClient, RpcHandler,
};

use common::*;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    init_logging();
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);
    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

async fn connect(url: &str) -> Arc<dyn Connection> {
    let config = AmqpConfig {
        url: url.to_string(),
        connect_retries: 5,
    };
    Arc::new(
        AmqpConnection::connect(&config)
            .await
            .expect("Failed to connect to RabbitMQ"),
    )
}

async fn multiply_now(request: Multiply) -> Result<Product, HandlerError> {
    Ok(Product {
        result: request.first_number * request.second_number,
    })
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_rpc_round_trip() {
    let (_container, url) = start_rabbitmq().await;

    let handler = RpcHandler::new("2", connect(&url).await, 1, multiply_now)
        .await
        .expect("Failed to create handler");
    handler.start().await.expect("Failed to start handler");

    let client = RpcClient::new(connect(&url).await).unwrap();
    let product: Product = client.call("2", &multiply(2, 3)).await.unwrap();
    assert_eq!(product.result, 6);
    assert_eq!(client.pending_calls(), 0);

    handler.close().await;
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_rpc_timeout_without_handler() {
    let (_container, url) = start_rabbitmq().await;

    let client = RpcClient::new(connect(&url).await).unwrap();
    let err = client
        .call_with_options::<Multiply, Product>("9", &multiply(1, 1), 2, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_secs(2)));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_rpc_handler_error_is_preserved() {
    let (_container, url) = start_rabbitmq().await;

    let handler = RpcHandler::new("2", connect(&url).await, 1, |_: Multiply| async {
        Err::<Product, HandlerError>("overflow".into())
    })
    .await
    .unwrap();
    handler.start().await.unwrap();

    let client = RpcClient::new(connect(&url).await).unwrap();
    let err = client
        .call::<Multiply, Product>("2", &multiply(1, 1))
        .await
        .unwrap_err();
    assert_eq!(err, Error::RpcHandling("overflow".to_string()));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_enqueue_outcomes() {
    let (_container, url) = start_rabbitmq().await;

    let emitter = Emitter::new("1", connect(&url).await).unwrap();
    let queue = format!("work-{}", uuid::Uuid::new_v4());
    emitter.declare_queue(&queue, 1).await.unwrap();
    emitter.declare_queue(&queue, 1).await.unwrap();

    emitter.enqueue(&queue, &WorkItem { id: 1 }).await.unwrap();
    assert_eq!(
        emitter.enqueue(&queue, &WorkItem { id: 2 }).await.unwrap_err(),
        Error::MessageNack
    );
    assert_eq!(emitter.message_count(&queue).await.unwrap(), 1);

    let missing = format!("missing-{}", uuid::Uuid::new_v4());
    assert!(matches!(
        emitter.enqueue(&missing, &WorkItem { id: 3 }).await,
        Err(Error::MessageRouting(_))
    ));

    assert_eq!(
        emitter.fetch_message::<WorkItem>(&queue).await.unwrap(),
        Some(WorkItem { id: 1 })
    );
    emitter.delete_queue(&queue).await.unwrap();
    emitter.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_queue_handler_consumes() {
    let (_container, url) = start_rabbitmq().await;

    let emitter = Emitter::new("1", connect(&url).await).unwrap();
    let queue = format!("jobs-{}", uuid::Uuid::new_v4());
    emitter.declare_queue(&queue, 0).await.unwrap();

    let worker = QueueHandler::new("2", connect(&url).await, &queue, 2, |_: WorkItem| async {
        Ok::<(), HandlerError>(())
    })
    .await
    .unwrap();
    let mut events = worker.events();
    worker.start().await.unwrap();

    emitter.enqueue(&queue, &WorkItem { id: 7 }).await.unwrap();
    assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(WorkItem { id: 7 })));
    assert!(matches!(next_event(&mut events).await, PumpEvent::Handled(WorkItem { id: 7 })));

    worker.close().await;
    emitter.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_broadcast_fanout() {
    let (_container, url) = start_rabbitmq().await;

    let mut receivers = Vec::new();
    let mut subscribers = Vec::new();
    for actor in ["2", "3"] {
        let subscriber = BroadcastHandler::new(actor, connect(&url).await, "1", |_: Notification| async {
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
        receivers.push(subscriber.events());
        subscriber.start().await.unwrap();
        subscribers.push(subscriber);
    }

    let emitter = Emitter::new("1", connect(&url).await).unwrap();
    let note = Notification {
        text: "ping".to_string(),
    };
    emitter.broadcast(&note).await.unwrap();

    for rx in receivers.iter_mut() {
        assert!(matches!(next_event(rx).await, PumpEvent::Incoming(_)));
        assert!(matches!(next_event(rx).await, PumpEvent::Handled(_)));
    }
    for subscriber in &subscribers {
        subscriber.close().await;
    }
}
