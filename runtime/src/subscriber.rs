//! Topic subscriptions and message dispatch.
//!
//! The bus keeps a single consumer connection. Each `subscribe()` call adds its
//! topics to that consumer's subscription and registers the handler for them.
//! One dispatcher task reads the consumer's message stream, decodes each record
//! into an [`EventEnvelope`] and hands it to every handler registered for the
//! record's topic, in registration order.
//!
//! A record that fails to decode, a handler returning `Err` and a handler that
//! panics are all logged as a [`DispatchError`] and counted. None of them stop
//! the loop.
//!
//! The record's offset is committed only after every handler has returned, so a
//! crash mid-dispatch redelivers the record (at-least-once).
//!
//! # Event-type registry
//!
//! Independently of topic routing, callers can register one handler per event
//! type (`register_event_handler`) and look it up from their own dispatch logic.
//! The dispatcher never consults it.

use crate::connection::{ConnectionManager, bounded};
use crate::metrics::{BusMetrics, ErrorKind};
use crate::registry::TopicRegistry;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use waypoint_core::envelope::{DeliveryMetadata, EventEnvelope};
use waypoint_core::error::{BusError, DispatchError};
use waypoint_core::transport::{ConsumerConnection, InboundMessage, InboundStream};

/// Boxed future returned by [`MessageHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Receives consumed events.
///
/// Implemented for any `Fn(EventEnvelope, DeliveryMetadata) -> impl Future<Output = anyhow::Result<()>>`,
/// so closures work directly (see [`handler_fn`]).
pub trait MessageHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// An error is logged and counted by the bus; it does not stop consumption.
    fn handle(&self, event: EventEnvelope, delivery: DeliveryMetadata) -> HandlerFuture<'_>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(EventEnvelope, DeliveryMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, event: EventEnvelope, delivery: DeliveryMetadata) -> HandlerFuture<'_> {
        Box::pin(self(event, delivery))
    }
}

/// Wrap a closure as a shareable handler.
///
/// # Example
///
/// ```
/// use waypoint_runtime::handler_fn;
///
/// let handler = handler_fn(|event, _delivery| async move {
///     println!("received {}", event.event_type);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(EventEnvelope, DeliveryMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(handler)
}

type Routes = HashMap<String, Vec<Arc<dyn MessageHandler>>>;

pub(crate) struct Subscriber {
    connection: Arc<ConnectionManager>,
    registry: Arc<TopicRegistry>,
    metrics: Arc<BusMetrics>,
    routes: Arc<RwLock<Routes>>,
    event_handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<TopicRegistry>,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        Self {
            connection,
            registry,
            metrics,
            routes: Arc::new(RwLock::new(HashMap::new())),
            event_handlers: RwLock::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribe the consumer to `topics` and route their messages to `handler`.
    pub(crate) async fn subscribe(
        &self,
        topics: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let consumer = self.connection.consumer().await?;
        let topics: Vec<String> = topics.iter().map(|topic| (*topic).to_string()).collect();
        if topics.is_empty() {
            return Err(BusError::Subscription {
                topics,
                reason: "no topics given".to_string(),
            });
        }

        // Held across the subscribe call so no message for these topics is
        // dispatched before the handler is routed.
        let mut routes = self.routes.write().await;

        let limit = self.connection.config().operation_timeout;
        if let Err(error) = bounded(limit, consumer.subscribe(&topics)).await {
            self.metrics.record_error(ErrorKind::Transport);
            tracing::error!(topics = ?topics, error = %error, "Subscribe failed");
            return Err(BusError::Subscription {
                topics,
                reason: error.to_string(),
            });
        }

        for topic in &topics {
            routes
                .entry(topic.clone())
                .or_default()
                .push(Arc::clone(&handler));
        }
        drop(routes);

        self.registry.add_topics(&topics).await;
        tracing::info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    /// Start dispatching from a freshly connected consumer.
    ///
    /// Topics routed before a reconnect are subscribed again on the new consumer.
    pub(crate) async fn attach(&self, consumer: Arc<dyn ConsumerConnection>) -> Result<(), BusError> {
        let stream = consumer
            .messages()
            .map_err(|e| BusError::Connection(format!("consumer stream unavailable: {e}")))?;

        let mut topics: Vec<String> = self.routes.read().await.keys().cloned().collect();
        if !topics.is_empty() {
            topics.sort();
            let limit = self.connection.config().operation_timeout;
            bounded(limit, consumer.subscribe(&topics))
                .await
                .map_err(|error| BusError::Subscription {
                    topics: topics.clone(),
                    reason: error.to_string(),
                })?;
            tracing::info!(topics = ?topics, "Re-subscribed after reconnect");
        }

        let task = tokio::spawn(dispatch_loop(
            stream,
            consumer,
            Arc::clone(&self.routes),
            Arc::clone(&self.metrics),
        ));
        if let Some(previous) = self.dispatcher.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Wait for the dispatcher to drain after the consumer was closed.
    pub(crate) async fn detach(&self, limit: Duration) {
        let Some(mut task) = self.dispatcher.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            tracing::warn!("Dispatcher did not stop in time, aborting");
            task.abort();
        }
    }

    pub(crate) async fn register_event_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) {
        let replaced = self
            .event_handlers
            .write()
            .await
            .insert(event_type.to_string(), handler)
            .is_some();
        tracing::debug!(event_type, replaced, "Registered event handler");
    }

    pub(crate) async fn event_handler(&self, event_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.event_handlers.read().await.get(event_type).cloned()
    }

    pub(crate) async fn event_handler_count(&self) -> usize {
        self.event_handlers.read().await.len()
    }
}

async fn dispatch_loop(
    mut stream: InboundStream,
    consumer: Arc<dyn ConsumerConnection>,
    routes: Arc<RwLock<Routes>>,
    metrics: Arc<BusMetrics>,
) {
    tracing::debug!("Dispatcher started");
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(message) => {
                let (topic, partition, offset) = (message.topic.clone(), message.partition, message.offset);
                dispatch(message, &routes, &metrics).await;

                if let Err(error) = consumer.commit(&topic, partition, offset) {
                    metrics.record_error(ErrorKind::Transport);
                    tracing::warn!(topic = %topic, partition, offset, error = %error, "Failed to commit offset");
                }
            }
            Err(error) => {
                metrics.record_error(ErrorKind::Transport);
                tracing::error!(error = %error, "Consumer error");
            }
        }
    }
    tracing::debug!("Message stream ended, dispatcher stopped");
}

async fn dispatch(message: InboundMessage, routes: &RwLock<Routes>, metrics: &BusMetrics) {
    let (event, delivery) = match decode(message) {
        Ok(decoded) => decoded,
        Err(error) => {
            metrics.record_error(ErrorKind::Dispatch);
            tracing::error!(error = %error, "Dropping undecodable message");
            return;
        }
    };
    metrics.record_consumed(&delivery.topic);
    tracing::trace!(
        topic = %delivery.topic,
        partition = delivery.partition,
        offset = delivery.offset,
        id = %event.id,
        "Dispatching event"
    );

    let handlers = routes
        .read()
        .await
        .get(&delivery.topic)
        .cloned()
        .unwrap_or_default();
    if handlers.is_empty() {
        tracing::debug!(topic = %delivery.topic, "No handler routed for topic");
        return;
    }

    for handler in handlers {
        if let Err(error) = invoke(handler.as_ref(), event.clone(), delivery.clone()).await {
            metrics.record_error(ErrorKind::Dispatch);
            tracing::error!(
                partition = delivery.partition,
                offset = delivery.offset,
                error = %error,
                "Handler failed"
            );
        }
    }
}

fn decode(message: InboundMessage) -> Result<(EventEnvelope, DeliveryMetadata), DispatchError> {
    let Some(payload) = message.payload.as_deref() else {
        return Err(DispatchError::MissingPayload {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
        });
    };

    let event = EventEnvelope::from_bytes(payload).map_err(|e| DispatchError::Malformed {
        topic: message.topic.clone(),
        partition: message.partition,
        offset: message.offset,
        reason: e.to_string(),
    })?;

    let delivery = DeliveryMetadata::new(
        message.topic,
        message.partition,
        message.offset,
        message.key.as_deref(),
        message.timestamp_ms,
    );
    Ok((event, delivery))
}

async fn invoke(
    handler: &dyn MessageHandler,
    event: EventEnvelope,
    delivery: DeliveryMetadata,
) -> Result<(), DispatchError> {
    let topic = delivery.topic.clone();
    let event_id = event.id.clone();

    match AssertUnwindSafe(async { handler.handle(event, delivery).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(DispatchError::Handler {
            topic,
            event_id,
            reason: format!("{error:#}"),
        }),
        Err(_) => Err(DispatchError::HandlerPanicked { topic, event_id }),
    }
}
