//! The in-memory exchange: a registry of addressable mailboxes.
//!
//! Each mailbox owns a bounded outbox of [FromMessage]s and at most one
//! live subscriber. [Exchange::connect] allocates a fresh mailbox;
//! [Exchange::reconnect] reattaches to an existing one, keeping any queued
//! messages. Routing between mailboxes happens through
//! [ConnectionHandle::send]; routing failures are answered in-band with a
//! `System` error into the sender's own mailbox, never delivered to the
//! missing or refused destination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::prelude::*;

use crate::wire::{Data, FromMessage};

/// Mailbox outbox capacity. Senders suspend while a destination outbox is
/// full.
const OUTBOX_CAPACITY: usize = 10;

/// Source of fresh mailbox ids.
pub trait IdProvider: Send + Sync {
    fn next_id(&self) -> String;
}

/// Decimal ids counted up from zero.
#[derive(Debug, Default)]
pub struct SequentialIdProvider {
    next: AtomicU64,
}

impl IdProvider for SequentialIdProvider {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Callback invoked for every message delivered to a mailbox.
pub type Subscriber = Box<dyn FnMut(FromMessage) -> BoxFuture<'static, ()> + Send>;

#[derive(Clone)]
struct Mailbox {
    sender: mpsc::Sender<FromMessage>,
    outbox: Arc<futures::lock::Mutex<Option<mpsc::Receiver<FromMessage>>>>,
    subscriber: Arc<futures::lock::Mutex<Subscriber>>,
}

impl Mailbox {
    fn create() -> Self {
        let (sender, receiver) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            sender,
            outbox: Arc::new(futures::lock::Mutex::new(Some(receiver))),
            subscriber: Arc::new(futures::lock::Mutex::new(Box::new(|_| {
                future::ready(()).boxed()
            }))),
        }
    }

    /// Install `subscriber` and make sure the delivery task is running.
    ///
    /// The first subscriber starts the task; until then messages queue in
    /// the outbox. The task invokes whichever subscriber is current at
    /// delivery time and holds the subscriber lock across the invocation,
    /// so a swap never interleaves with a delivery.
    async fn subscribe(&self, subscriber: Subscriber) {
        {
            let mut current = self.subscriber.lock().await;
            *current = subscriber;
        }
        if let Some(mut receiver) = self.outbox.lock().await.take() {
            let current = Arc::clone(&self.subscriber);
            async_std::task::spawn(async move {
                while let Some(message) = receiver.next().await {
                    let mut subscriber = current.lock().await;
                    (subscriber)(message).await;
                }
            });
        }
    }
}

/// Registry of mailboxes. Cloning yields another handle to the same
/// registry.
#[derive(Clone)]
pub struct Exchange {
    mailboxes: Arc<async_std::sync::RwLock<HashMap<String, Mailbox>>>,
    id_provider: Arc<dyn IdProvider>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("there is no outbox for the provided id [{0}]")]
    UnknownId(String),
}

impl Exchange {
    pub fn new(id_provider: impl IdProvider + 'static) -> Self {
        Self {
            mailboxes: Arc::new(async_std::sync::RwLock::new(HashMap::new())),
            id_provider: Arc::new(id_provider),
        }
    }

    /// Allocate a fresh mailbox and return a handle bound to it.
    pub async fn connect(&self) -> ConnectionHandle {
        let mut mailboxes = self.mailboxes.write().await;
        let id = self.id_provider.next_id();
        let mailbox = Mailbox::create();
        mailboxes.insert(id.clone(), mailbox.clone());
        tracing::debug!(%id, "mailbox created");
        ConnectionHandle {
            id,
            mailbox,
            exchange: self.clone(),
        }
    }

    /// Reattach to an existing mailbox. Messages queued while no subscriber
    /// was attached remain and are delivered to the next subscriber.
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionHandle, ReconnectError> {
        let mailboxes = self.mailboxes.read().await;
        match mailboxes.get(id) {
            Some(mailbox) => Ok(ConnectionHandle {
                id: id.to_string(),
                mailbox: mailbox.clone(),
                exchange: self.clone(),
            }),
            None => Err(ReconnectError::UnknownId(id.to_string())),
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Exchange").finish_non_exhaustive()
    }
}

/// A handle to one mailbox of an [Exchange].
pub struct ConnectionHandle {
    id: String,
    mailbox: Mailbox,
    exchange: Exchange,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the mailbox subscriber.
    ///
    /// Messages not yet delivered at the time of the swap go to the new
    /// subscriber; the old subscriber is never invoked again.
    pub async fn subscribe(&self, subscriber: Subscriber) {
        self.mailbox.subscribe(subscriber).await;
    }

    /// Route `data` to the mailbox `to`.
    ///
    /// Unknown destinations and self-sends are answered with a `System`
    /// error into the sender's own mailbox. Sending suspends while the
    /// destination outbox is full.
    pub async fn send(&self, to: &str, data: Data) {
        // Senders are cloned out so the registry lock is not held across
        // the (possibly suspending) enqueue.
        let (destination, own) = {
            let mailboxes = self.exchange.mailboxes.read().await;
            (
                mailboxes.get(to).map(|mailbox| mailbox.sender.clone()),
                mailboxes.get(&self.id).map(|mailbox| mailbox.sender.clone()),
            )
        };
        match destination {
            None => {
                tracing::debug!(to, "destination does not exist");
                if let Some(mut own) = own {
                    let _ = own
                        .send(FromMessage::system_error(format!(
                            "Destination does not exist [{}]",
                            to
                        )))
                        .await;
                }
            }
            Some(_) if to == self.id => {
                if let Some(mut own) = own {
                    let _ = own
                        .send(FromMessage::system_error(
                            "Sending a message to oneself is not supported",
                        ))
                        .await;
                }
            }
            Some(mut destination) => {
                let _ = destination
                    .send(FromMessage {
                        from: self.id.clone(),
                        data,
                    })
                    .await;
            }
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
