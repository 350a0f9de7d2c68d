//! End-to-end encryption layered on top of a [Connection].
//!
//! After a successful handshake every frame between the hub and the client
//! is carried inside an outer `Message` frame whose body is the RSA-OAEP
//! ciphertext of the inner frame, encoded as a signed-byte array.

use std::sync::Arc;

use crate::crypto::{LocalIdentity, RemoteKey};
use crate::socket::{BoxSubscription, Connection, Subscription, SubscriptionId};
use crate::wire::{self, Message, OutgoingMessage};

/// Wraps a [Connection] so that outbound frames are encrypted with the
/// peer's public key and inbound frames are decrypted with the local
/// private key, transparently to the caller.
pub struct EncryptedConnection<C> {
    inner: Arc<C>,
    local: LocalIdentity,
    remote: RemoteKey,
}

impl<C: Connection> EncryptedConnection<C> {
    pub fn new(inner: Arc<C>, local: LocalIdentity, remote: RemoteKey) -> Self {
        Self {
            inner,
            local,
            remote,
        }
    }
}

#[async_trait::async_trait]
impl<C: Connection + 'static> Connection for EncryptedConnection<C> {
    async fn write(&self, message: OutgoingMessage) -> anyhow::Result<()> {
        let plaintext = serde_json::to_vec(&message)?;
        let ciphertext = self.remote.encrypt(&plaintext)?;
        let body = serde_json::json!(wire::to_signed_bytes(&ciphertext));
        self.inner
            .write(OutgoingMessage::new("Message", body))
            .await
    }

    fn subscribe(&self, subscription: BoxSubscription) -> SubscriptionId {
        self.inner.subscribe(Box::new(DecryptSubscription {
            local: self.local.clone(),
            inner: subscription,
        }))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id)
    }
}

impl<C> std::fmt::Debug for EncryptedConnection<C> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EncryptedConnection").finish_non_exhaustive()
    }
}

/// Decrypts inbound frames and forwards the inner message.
///
/// Frames that cannot be decoded, decrypted, or reparsed are logged and
/// dropped; a bad frame never tears down the connection.
struct DecryptSubscription {
    local: LocalIdentity,
    inner: BoxSubscription,
}

impl Subscription for DecryptSubscription {
    fn received_message(&mut self, message: Message) {
        let ciphertext = match wire::decode_cipher_payload(&message.data) {
            Some(ciphertext) => ciphertext,
            None => {
                tracing::warn!(variant = %message.variant, "inbound frame carries no ciphertext");
                return;
            }
        };
        let plaintext = match self.local.decrypt(&ciphertext) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                tracing::warn!(?error, "failed to decrypt inbound frame");
                return;
            }
        };
        match serde_json::from_slice::<Message>(&plaintext) {
            Ok(inner) => self.inner.received_message(inner),
            Err(error) => tracing::warn!(?error, "failed to parse decrypted frame"),
        }
    }

    fn connection_dropped(&mut self) {
        self.inner.connection_dropped();
    }
}
