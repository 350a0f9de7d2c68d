//! A duplex message transport with multiplexed subscribers.
//!
//! [SocketConnection] sits on top of any framed byte transport (a
//! `Sink`/`Stream` pair of raw JSON frames) and owns two tasks: a reader
//! that decodes inbound frames and a dispatcher that fans each frame out to
//! the current set of [Subscription]s. The dispatcher is the single owner
//! of the subscription map, so subscribe and unsubscribe never race with a
//! delivery.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::prelude::*;

use crate::wire::{Message, OutgoingMessage};

/// Callbacks attached to a connection.
///
/// All callbacks for one inbound frame complete before the next frame is
/// dispatched.
pub trait Subscription: Send {
    fn received_message(&mut self, message: Message);
    fn connection_dropped(&mut self);
}

pub type BoxSubscription = Box<dyn Subscription>;

/// Identifies a [Subscription] within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A duplex client connection.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    async fn write(&self, message: OutgoingMessage) -> anyhow::Result<()>;
    fn subscribe(&self, subscription: BoxSubscription) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

type BoxFrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = anyhow::Error> + Send + 'static>>;

/// Shared handle to the transport sink. Writes from concurrent tasks are
/// serialised through the lock.
#[derive(Clone)]
struct FrameWriter {
    sink: Arc<futures::lock::Mutex<BoxFrameSink>>,
}

impl FrameWriter {
    fn new<Si>(sink: Si) -> Self
    where
        Si: Sink<Vec<u8>> + Send + Unpin + 'static,
        Si::Error: std::error::Error + Send + Sync + 'static,
    {
        let sink = sink.sink_map_err(anyhow::Error::from);
        Self {
            sink: Arc::new(futures::lock::Mutex::new(Box::pin(sink))),
        }
    }

    async fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }
}

enum DispatchInput {
    Frame(Message),
    Disconnected,
    Subscribe(SubscriptionId, BoxSubscription),
    Unsubscribe(SubscriptionId),
}

/// A [Connection] over a framed byte transport.
pub struct SocketConnection {
    writer: FrameWriter,
    control_sender: mpsc::UnboundedSender<DispatchInput>,
    next_subscription_id: AtomicU64,
}

impl SocketConnection {
    /// Spawns the reader and dispatcher tasks for the given transport.
    pub fn new<Si, St>(send: Si, receive: St) -> Self
    where
        Si: Sink<Vec<u8>> + Send + Unpin + 'static,
        Si::Error: std::error::Error + Send + Sync + 'static,
        St: TryStream<Ok = Vec<u8>> + Send + Unpin + 'static,
        St::Error: std::error::Error + Send + Sync + 'static,
    {
        // Reader and control share one queue so that a subscription pushed
        // before a frame arrives is always installed before that frame is
        // dispatched.
        let (control_sender, control_receiver) = mpsc::unbounded();
        async_std::task::spawn(read_frames(receive, control_sender.clone()));
        async_std::task::spawn(dispatch(control_receiver));
        Self {
            writer: FrameWriter::new(send),
            control_sender,
            next_subscription_id: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Connection for SocketConnection {
    async fn write(&self, message: OutgoingMessage) -> anyhow::Result<()> {
        let frame = serde_json::to_vec(&message)?;
        self.writer.send(frame).await
    }

    fn subscribe(&self, subscription: BoxSubscription) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        // A send failure means the connection already dispatched its
        // disconnect; the subscription would only ever observe the drop.
        let _ = self
            .control_sender
            .unbounded_send(DispatchInput::Subscribe(id, subscription));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self
            .control_sender
            .unbounded_send(DispatchInput::Unsubscribe(id));
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SocketConnection").finish_non_exhaustive()
    }
}

async fn read_frames<St>(mut receive: St, sender: mpsc::UnboundedSender<DispatchInput>)
where
    St: TryStream<Ok = Vec<u8>> + Unpin,
    St::Error: std::error::Error,
{
    loop {
        match receive.try_next().await {
            Ok(Some(frame)) => match serde_json::from_slice::<Message>(&frame) {
                Ok(message) => {
                    if sender.unbounded_send(DispatchInput::Frame(message)).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(?error, "failed to decode inbound frame");
                    break;
                }
            },
            Ok(None) => {
                tracing::debug!("transport closed");
                break;
            }
            Err(error) => {
                tracing::warn!(?error, "transport read failed");
                break;
            }
        }
    }
    let _ = sender.unbounded_send(DispatchInput::Disconnected);
}

async fn dispatch(mut inputs: mpsc::UnboundedReceiver<DispatchInput>) {
    let mut subscriptions: HashMap<SubscriptionId, BoxSubscription> = HashMap::new();
    while let Some(input) = inputs.next().await {
        match input {
            DispatchInput::Frame(message) => {
                tracing::trace!(
                    variant = %message.variant,
                    subscribers = subscriptions.len(),
                    "dispatch message"
                );
                for subscription in subscriptions.values_mut() {
                    subscription.received_message(message.clone());
                }
            }
            DispatchInput::Disconnected => {
                for subscription in subscriptions.values_mut() {
                    subscription.connection_dropped();
                }
                break;
            }
            DispatchInput::Subscribe(id, subscription) => {
                tracing::trace!(?id, "subscribe");
                subscriptions.insert(id, subscription);
            }
            DispatchInput::Unsubscribe(id) => {
                tracing::trace!(?id, "unsubscribe");
                subscriptions.remove(&id);
            }
        }
    }
}
