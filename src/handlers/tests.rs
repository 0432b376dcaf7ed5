use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Barrier};

use super::*;
use crate::emitter::Emitter;
use crate::envelope::ValidationErrors;
use crate::events::{ErrorKind, LifecycleEvent, PumpEvent};
use crate::lifecycle::BrokerAdmin;
use crate::transport::{Connection, MemoryBroker, MessageProperties, DEFAULT_EXCHANGE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    label: String,
}

impl Payload for Job {
    fn type_tag() -> &'static str {
        "test.Job"
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        if self.label.is_empty() {
            return Err(ValidationErrors::single("label is required"));
        }
        Ok(())
    }
}

fn job(id: u32) -> Job {
    Job {
        id,
        label: format!("job-{}", id),
    }
}

async fn ok(_: Job) -> Result<(), HandlerError> {
    Ok(())
}

async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timed out")
        .unwrap()
}

async fn publish_raw(broker: &MemoryBroker, queue: &str, body: &[u8]) {
    let channel = broker.connect().create_channel().await.unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, queue, body, MessageProperties::json(), false)
        .await
        .unwrap();
}

mod queue_handler {
    use super::*;

    async fn setup(broker: &MemoryBroker) -> Emitter {
        let emitter = Emitter::new("1", broker.connect()).unwrap();
        emitter.declare_queue("jobs", 0).await.unwrap();
        emitter
    }

    #[tokio::test]
    async fn test_messages_are_handled_in_order() {
        let broker = MemoryBroker::new();
        let emitter = setup(&broker).await;
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 1, ok)
            .await
            .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();

        for id in 0..3 {
            emitter.enqueue("jobs", &job(id)).await.unwrap();
        }
        for id in 0..3 {
            assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(j) if j.id == id));
            assert!(matches!(next_event(&mut events).await, PumpEvent::Handled(j) if j.id == id));
        }
        assert_eq!(broker.message_count("jobs"), Some(0));
    }

    #[tokio::test]
    async fn test_bad_messages_are_reported_and_drained() {
        let broker = MemoryBroker::new();
        let emitter = setup(&broker).await;
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 1, ok)
            .await
            .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();

        publish_raw(&broker, "jobs", b"garbage").await;
        match next_event(&mut events).await {
            PumpEvent::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Deserializing);
                assert_eq!(e.actor_id, "2");
                assert_eq!(e.raw.as_deref(), Some(&b"garbage"[..]));
                assert!(e.incoming.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let invalid = Job {
            id: 9,
            label: String::new(),
        };
        emitter.enqueue("jobs", &invalid).await.unwrap();
        match next_event(&mut events).await {
            PumpEvent::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Validating);
                assert_eq!(e.incoming, Some(invalid));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The consumer keeps going after failures.
        emitter.enqueue("jobs", &job(1)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(_)));
        assert!(matches!(next_event(&mut events).await, PumpEvent::Handled(_)));
        assert_eq!(broker.message_count("jobs"), Some(0));
    }

    #[tokio::test]
    async fn test_handler_failures_and_panics_are_reported() {
        let broker = MemoryBroker::new();
        let emitter = setup(&broker).await;
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 1, |j: Job| async move {
            match j.id {
                0 => Err::<(), HandlerError>("rejected by business rule".into()),
                _ => panic!("boom"),
            }
        })
        .await
        .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();

        emitter.enqueue("jobs", &job(0)).await.unwrap();
        emitter.enqueue("jobs", &job(1)).await.unwrap();

        let mut messages = Vec::new();
        while messages.len() < 2 {
            if let PumpEvent::Error(e) = next_event(&mut events).await {
                assert_eq!(e.kind, ErrorKind::Handling);
                assert!(e.incoming.is_some());
                messages.push(e.message);
            }
        }
        assert_eq!(messages, vec!["rejected by business rule", "boom"]);
        assert!(handler.is_running());
    }

    #[tokio::test]
    async fn test_concurrency_runs_messages_in_parallel() {
        let broker = MemoryBroker::new();
        let emitter = setup(&broker).await;
        let barrier = Arc::new(Barrier::new(3));
        let gate = Arc::clone(&barrier);
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 3, move |_: Job| {
            let gate = Arc::clone(&gate);
            async move {
                gate.wait().await;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();
        assert_eq!(broker.consumer_count("jobs"), 3);

        for id in 0..3 {
            emitter.enqueue("jobs", &job(id)).await.unwrap();
        }
        // Only completes if all three are in flight at once.
        let mut handled = 0;
        while handled < 3 {
            if let PumpEvent::Handled(_) = next_event(&mut events).await {
                handled += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let broker = MemoryBroker::new();
        let _emitter = setup(&broker).await;
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 2, ok)
            .await
            .unwrap();
        handler.start().await.unwrap();
        handler.start().await.unwrap();
        assert_eq!(broker.consumer_count("jobs"), 2);
    }

    #[tokio::test]
    async fn test_missing_queue_fails_to_start() {
        let broker = MemoryBroker::new();
        let handler = QueueHandler::new("2", broker.connect(), "absent", 1, ok)
            .await
            .unwrap();
        let err = handler.start().await.unwrap_err();
        assert!(matches!(err, crate::Error::Subscription { .. }));
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let broker = MemoryBroker::new();
        assert!(
            QueueHandler::<Job>::new("2", broker.connect(), "rpc_2_x", 1, ok)
                .await
                .err()
                .unwrap()
                .is_invalid_argument()
        );
        assert!(matches!(
            QueueHandler::<Job>::new("2", broker.connect(), "jobs", 0, ok)
                .await
                .err()
                .unwrap(),
            crate::Error::OutOfRange { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_keeps_queue() {
        let broker = MemoryBroker::new();
        let _emitter = setup(&broker).await;
        let handler = QueueHandler::new("2", broker.connect(), "jobs", 1, ok)
            .await
            .unwrap();
        let mut lifecycle = handler.lifecycle_events();
        handler.start().await.unwrap();
        assert_eq!(next_event(&mut lifecycle).await, LifecycleEvent::Started);

        handler.close().await;
        assert_eq!(next_event(&mut lifecycle).await, LifecycleEvent::Stopped);
        assert!(broker.queue_exists("jobs"));
        assert_eq!(broker.consumer_count("jobs"), 0);
    }
}

mod broadcast_handler {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_each_broadcast() {
        let broker = MemoryBroker::new();
        let emitter = Emitter::new("1", broker.connect()).unwrap();

        let first = BroadcastHandler::new("2", broker.connect(), "1", ok)
            .await
            .unwrap();
        let second = BroadcastHandler::new("3", broker.connect(), "1", ok)
            .await
            .unwrap();
        let mut first_events = first.events();
        let mut second_events = second.events();
        first.start().await.unwrap();
        second.start().await.unwrap();
        assert_eq!(first.exchange_name(), "broadcast_1");
        assert_ne!(first.queue_name(), second.queue_name());

        emitter.broadcast(&job(7)).await.unwrap();
        for events in [&mut first_events, &mut second_events] {
            assert!(matches!(next_event(events).await, PumpEvent::Incoming(j) if j.id == 7));
            assert!(matches!(next_event(events).await, PumpEvent::Handled(j) if j.id == 7));
        }
    }

    #[tokio::test]
    async fn test_errors_name_the_source_actor() {
        let broker = MemoryBroker::new();
        let emitter = Emitter::new("1", broker.connect()).unwrap();
        let handler = BroadcastHandler::new("2", broker.connect(), "1", |_: Job| async {
            Err::<(), HandlerError>("not today".into())
        })
        .await
        .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();

        emitter.broadcast(&job(1)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(_)));
        match next_event(&mut events).await {
            PumpEvent::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Handling);
                assert_eq!(e.actor_id, "2");
                assert_eq!(e.counterpart_id.as_deref(), Some("1"));
                assert_eq!(e.message, "not today");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcasts_before_start_are_not_received() {
        let broker = MemoryBroker::new();
        let emitter = Emitter::new("1", broker.connect()).unwrap();
        emitter.broadcast(&job(1)).await.unwrap();

        let handler = BroadcastHandler::new("2", broker.connect(), "1", ok)
            .await
            .unwrap();
        let mut events = handler.events();
        handler.start().await.unwrap();
        emitter.broadcast(&job(2)).await.unwrap();

        assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(j) if j.id == 2));
    }

    #[tokio::test]
    async fn test_close_deletes_private_queue() {
        let broker = MemoryBroker::new();
        let handler = BroadcastHandler::new("2", broker.connect(), "1", ok)
            .await
            .unwrap();
        assert!(handler.queue_name().is_none());
        handler.start().await.unwrap();
        let queue = handler.queue_name().unwrap().to_string();
        assert!(broker.queue_exists(&queue));
        assert!(handler.is_running());

        handler.close().await;
        assert!(!broker.queue_exists(&queue));
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = MemoryBroker::new();
        let handler = BroadcastHandler::new("2", broker.connect(), "1", ok)
            .await
            .unwrap();
        handler.start().await.unwrap();
        assert!(handler.start().await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_concurrent_starts_bind_one_queue() {
        let broker = MemoryBroker::new();
        let emitter = Emitter::new("1", broker.connect()).unwrap();
        let handler = BroadcastHandler::new("2", broker.connect(), "1", ok)
            .await
            .unwrap();
        let mut events = handler.events();

        let (first, second) = tokio::join!(handler.start(), handler.start());
        assert!(first.is_ok() != second.is_ok());
        assert!(first.or(second).is_ok());

        emitter.broadcast(&job(5)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, PumpEvent::Incoming(j) if j.id == 5));
        assert!(matches!(next_event(&mut events).await, PumpEvent::Handled(j) if j.id == 5));
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blank_source_rejected() {
        let broker = MemoryBroker::new();
        let result = BroadcastHandler::<Job>::new("2", broker.connect(), "", ok).await;
        assert!(result.err().unwrap().is_invalid_argument());
    }
}

#[tokio::test]
async fn test_panic_message_extraction() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let result: Result<(), String> = run_guarded(Box::pin(async move {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("formatted {}", 42);
        }
        Ok::<(), HandlerError>(())
    }))
    .await;
    assert_eq!(result.unwrap_err(), "formatted 42");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
