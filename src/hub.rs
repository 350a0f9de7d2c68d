//! Accepts connections, runs the handshake, and binds verified connections
//! to the exchange.
//!
//! [Hub::add_connection] spawns two tasks per connection: the handshake
//! driver, which feeds inbound frames to the [Handshake] state machine and
//! answers with its outcomes, and the relay driver, which waits on a
//! one-shot channel for the verified [EncryptedConnection] and then routes
//! traffic between it and an exchange mailbox. If the handshake ends
//! without a verification the one-shot channel closes and the relay driver
//! exits without ever joining the exchange.

use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use uuid::Uuid;

use crate::crypto::LocalIdentity;
use crate::encrypted::EncryptedConnection;
use crate::exchange::Exchange;
use crate::handshake::{Handshake, Outcome};
use crate::socket::{Connection, Subscription};
use crate::wire::{FromMessage, Message, OutgoingMessage, PublicKeyBody, ToMessage, VerifyBody};

/// Entry point tying new connections to the exchange.
pub struct Hub {
    exchange: Exchange,
}

impl Hub {
    pub fn new(exchange: Exchange) -> Self {
        Self { exchange }
    }

    /// Take ownership of a connection: handshake first, relay on success.
    pub fn add_connection<C: Connection + 'static>(&self, connection: Arc<C>) {
        let (verified_sender, verified_receiver) = oneshot::channel();
        async_std::task::spawn(run_handshake(connection, verified_sender));
        async_std::task::spawn(run_relay(verified_receiver, self.exchange.clone()));
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Hub").finish_non_exhaustive()
    }
}

/// What happened to a connection as a consequence of one inbound frame.
enum Step<C> {
    Continue,
    Fatal,
    Verified(EncryptedConnection<C>),
}

enum ConnectionEvent {
    Message(Message),
    Dropped,
}

/// Forwards connection callbacks into a driver's event channel.
struct EventSubscription(mpsc::UnboundedSender<ConnectionEvent>);

impl Subscription for EventSubscription {
    fn received_message(&mut self, message: Message) {
        let _ = self.0.unbounded_send(ConnectionEvent::Message(message));
    }

    fn connection_dropped(&mut self) {
        let _ = self.0.unbounded_send(ConnectionEvent::Dropped);
    }
}

async fn run_handshake<C: Connection + 'static>(
    connection: Arc<C>,
    verified_sender: oneshot::Sender<EncryptedConnection<C>>,
) {
    let (event_sender, mut events) = mpsc::unbounded();
    let subscription_id = connection.subscribe(Box::new(EventSubscription(event_sender)));

    let verification_code = format!("[{}]", Uuid::new_v4());
    let local = match LocalIdentity::generate() {
        Ok(local) => local,
        Err(error) => {
            tracing::error!(?error, "failed to generate server identity");
            connection.unsubscribe(subscription_id);
            return;
        }
    };
    let mut handshake = Handshake::new(local);

    // `Ready` goes out before any inbound frame is consumed.
    respond(&connection, handshake.signal_ready()).await;

    let mut verified = None;
    while let Some(event) = events.next().await {
        let message = match event {
            ConnectionEvent::Message(message) => message,
            ConnectionEvent::Dropped => {
                tracing::debug!("connection dropped during handshake");
                break;
            }
        };
        let mut verification_attempted = false;
        let outcome = match message.variant.as_str() {
            "GetPublicKey" => Some(handshake.send_key()),
            "GetVerification" => Some(handshake.send_verification(&verification_code)),
            "SetPublicKey" => match serde_json::from_value::<PublicKeyBody>(message.data) {
                Ok(body) if !body.public_key.is_empty() => {
                    Some(handshake.receive_key(&body.public_key))
                }
                Ok(_) => {
                    tracing::warn!("public key may not be empty");
                    break;
                }
                Err(error) => {
                    tracing::warn!(?error, "failed to parse SetPublicKey data");
                    break;
                }
            },
            "Verify" => match serde_json::from_value::<VerifyBody>(message.data) {
                Ok(body) => {
                    verification_attempted = true;
                    Some(handshake.verify(&crate::wire::from_signed_bytes(&body.message)))
                }
                Err(error) => {
                    tracing::warn!(?error, "failed to parse Verify data");
                    break;
                }
            },
            other => {
                tracing::trace!(variant = other, "ignoring frame during handshake");
                None
            }
        };
        if let Some(outcome) = outcome {
            match respond(&connection, outcome).await {
                Step::Continue => {}
                Step::Fatal => break,
                Step::Verified(encrypted) => {
                    verified = Some(encrypted);
                    break;
                }
            }
        }
        if verification_attempted {
            break;
        }
    }

    connection.unsubscribe(subscription_id);
    if let Some(encrypted) = verified {
        if verified_sender.send(encrypted).is_err() {
            tracing::warn!("relay driver is gone, dropping verified connection");
        }
    }
    tracing::debug!("handshake workflow complete");
}

/// Translate a handshake [Outcome] into a frame on the wire.
///
/// Write failures are only logged: a broken transport surfaces through the
/// reader as a disconnect event.
async fn respond<C: Connection + 'static>(connection: &Arc<C>, outcome: Outcome) -> Step<C> {
    let frame = match outcome {
        Outcome::Ready => OutgoingMessage::bare("Ready"),
        Outcome::ServerKey(der) => OutgoingMessage::new(
            "ServerKey",
            serde_json::json!({ "publicKey": crate::wire::to_signed_bytes(&der) }),
        ),
        Outcome::KeyReceived => OutgoingMessage::bare("KeyReceived"),
        Outcome::Verification(ciphertext) => OutgoingMessage::new(
            "Verification",
            serde_json::json!({ "message": crate::wire::to_signed_bytes(&ciphertext) }),
        ),
        Outcome::Error(reason) => {
            tracing::warn!(%reason, "handshake error");
            let frame = OutgoingMessage::new(
                "Error",
                serde_json::json!(format!(
                    "Error -> [{}] connection will be dropped",
                    reason
                )),
            );
            if let Err(error) = connection.write(frame).await {
                tracing::warn!(?error, "failed to write error frame");
            }
            return Step::Fatal;
        }
        Outcome::Verified { remote, local } => {
            return Step::Verified(EncryptedConnection::new(
                Arc::clone(connection),
                local,
                remote,
            ));
        }
    };
    if let Err(error) = connection.write(frame).await {
        tracing::warn!(?error, "failed to write frame");
    }
    Step::Continue
}

async fn run_relay<C: Connection + 'static>(
    verified_receiver: oneshot::Receiver<EncryptedConnection<C>>,
    exchange: Exchange,
) {
    let connection = match verified_receiver.await {
        Ok(connection) => Arc::new(connection),
        Err(oneshot::Canceled) => return,
    };

    // Subscribe before the welcome frames so nothing the client sends right
    // after verifying can slip past the relay.
    let (event_sender, mut events) = mpsc::unbounded();
    connection.subscribe(Box::new(EventSubscription(event_sender)));

    let handle = exchange.connect().await;
    tracing::info!(id = %handle.id(), "connection joined the exchange");

    let outbound = Arc::clone(&connection);
    handle
        .subscribe(Box::new(move |message: FromMessage| {
            let outbound = Arc::clone(&outbound);
            async move {
                let frame = OutgoingMessage::new("Message", serde_json::json!(message));
                if let Err(error) = outbound.write(frame).await {
                    tracing::warn!(?error, "failed to forward exchange message");
                }
            }
            .boxed()
        }))
        .await;

    let welcome = OutgoingMessage::new("Welcome", serde_json::json!("Welcome to the exchange!"));
    if let Err(error) = connection.write(welcome).await {
        tracing::warn!(?error, "failed to write welcome frame");
    }
    let actions = OutgoingMessage::new(
        "AvailableActions",
        serde_json::json!(["connect", "reconnect"]),
    );
    if let Err(error) = connection.write(actions).await {
        tracing::warn!(?error, "failed to write actions frame");
    }

    while let Some(event) = events.next().await {
        let message = match event {
            ConnectionEvent::Message(message) => message,
            ConnectionEvent::Dropped => {
                tracing::debug!(id = %handle.id(), "connection dropped");
                break;
            }
        };
        match serde_json::from_value::<ToMessage>(message.data) {
            Ok(to_message) => handle.send(&to_message.to, to_message.data).await,
            Err(error) => {
                tracing::warn!(?error, "failed to parse relay message");
                let frame =
                    OutgoingMessage::new("ERROR", serde_json::json!(error.to_string()));
                if let Err(error) = connection.write(frame).await {
                    tracing::warn!(?error, "failed to write relay error frame");
                }
            }
        }
    }
}
