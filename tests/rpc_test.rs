mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_broker::config::{BrokerConfig, QueueConfig};
use service_broker::messaging::{
    BrokerError, DeliveryMetadata, HandlerOutcome, MessageHandler, RpcHandler, ShutdownSignal,
};

use common::{broker_config, in_memory_with};

fn rpc_config() -> BrokerConfig {
    broker_config().with_queue(QueueConfig::durable("pricing").on_exchange("rpc").bind("pricing.quote"))
}

#[derive(Debug, Serialize)]
struct QuoteRequest {
    sku: String,
    qty: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Quote {
    sku: String,
    total: u32,
}

#[tokio::test]
async fn test_request_returns_responder_payload() {
    let (_memory, broker) = in_memory_with(rpc_config());
    let shutdown = ShutdownSignal::new();
    let handler: Arc<dyn RpcHandler> = Arc::new(|request: Value, _metadata: DeliveryMetadata| async move {
        let qty = request["qty"].as_u64().unwrap_or(0);
        Ok::<_, anyhow::Error>(json!({"sku": request["sku"], "total": qty * 25}))
    });
    let server = broker.rpc_server("pricing", handler).with_shutdown(shutdown.clone());
    let serving = tokio::spawn(async move { server.run().await });

    let quote: Quote = broker
        .call(
            "rpc",
            "pricing.quote",
            &QuoteRequest {
                sku: "A-1".into(),
                qty: 4,
            },
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(
        quote,
        Quote {
            sku: "A-1".into(),
            total: 100,
        }
    );
    assert_eq!(broker.rpc().pending_count(), 0);

    shutdown.trigger();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_request_without_responder_times_out_not_earlier() {
    let (_memory, broker) = in_memory_with(rpc_config());
    let timeout = Duration::from_secs(2);

    let started = Instant::now();
    let result = broker
        .request("rpc", "inventory.check", &json!({"sku": "A-1"}), Some(timeout))
        .await;
    let elapsed = started.elapsed();

    assert_matches!(result, Err(BrokerError::RequestTimeout { timeout: t, .. }) if t == timeout);
    assert!(elapsed >= timeout, "timed out early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(1));
    assert_eq!(broker.rpc().pending_count(), 0);
}

/// 收集兩個請求後以相反順序回覆
#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies_out_of_order() {
    let (_memory, broker) = in_memory_with(rpc_config());
    let publisher = broker.publisher().clone();
    let waiting = Arc::new(Mutex::new(Vec::<(Value, DeliveryMetadata)>::new()));

    let handler: Arc<dyn MessageHandler> = Arc::new(move |body: Value, metadata: DeliveryMetadata| {
        let publisher = publisher.clone();
        let waiting = waiting.clone();
        async move {
            let batch = {
                let mut waiting = waiting.lock();
                waiting.push((body, metadata));
                if waiting.len() < 2 {
                    return Ok(HandlerOutcome::Ack);
                }
                std::mem::take(&mut *waiting)
            };
            for (body, metadata) in batch.iter().rev() {
                let reply_to = metadata.reply_to.as_deref().unwrap_or_default();
                let correlation_id = metadata.correlation_id.as_deref().unwrap_or_default();
                publisher
                    .publish_reply(reply_to, correlation_id, &json!({"echo": body["n"]}))
                    .await?;
            }
            Ok::<_, anyhow::Error>(HandlerOutcome::Stop)
        }
    });
    let responder = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .consume("pricing", handler, ShutdownSignal::new(), Some(Duration::from_secs(5)))
                .await
        })
    };

    let timeout = Some(Duration::from_secs(3));
    let (first_payload, second_payload) = (json!({"n": 1}), json!({"n": 2}));
    let (first, second) = tokio::join!(
        broker.request("rpc", "pricing.quote", &first_payload, timeout),
        broker.request("rpc", "pricing.quote", &second_payload, timeout),
    );

    assert_eq!(first.unwrap(), json!({"echo": 1}));
    assert_eq!(second.unwrap(), json!({"echo": 2}));
    responder.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let (memory, broker) = in_memory_with(rpc_config());
    let (received, handler) = common::recording(HandlerOutcome::Stop);
    let responder = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .consume("pricing", handler, ShutdownSignal::new(), Some(Duration::from_secs(2)))
                .await
        })
    };

    let result = broker
        .request("rpc", "pricing.quote", &json!({"sku": "A-1"}), Some(Duration::from_millis(300)))
        .await;
    let correlation_id = match result {
        Err(BrokerError::RequestTimeout { correlation_id, .. }) => correlation_id,
        other => panic!("expected a request timeout, got {:?}", other),
    };
    responder.await.unwrap().unwrap();

    let metadata = received.lock()[0].1.clone();
    assert_eq!(metadata.correlation_id.as_deref(), Some(correlation_id.as_str()));
    let reply_to = metadata.reply_to.unwrap();

    broker
        .publisher()
        .publish_reply(&reply_to, &correlation_id, &json!({"total": 25}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(memory.message_count(&reply_to), 0);
    assert_eq!(memory.unacked_count(&reply_to), 0);
    assert_eq!(broker.rpc().pending_count(), 0);
}

#[tokio::test]
async fn test_reply_queue_is_removed_on_disconnect() {
    let (memory, broker) = in_memory_with(rpc_config());
    let _ = broker
        .request("rpc", "nobody.home", &json!({}), Some(Duration::from_millis(100)))
        .await;

    let reply_queues: Vec<String> = memory
        .queue_names()
        .into_iter()
        .filter(|name| name.starts_with("rpc.reply."))
        .collect();
    assert_eq!(reply_queues.len(), 1);

    broker.disconnect().await.unwrap();

    assert!(!memory.has_queue(&reply_queues[0]));
}
