//! The key-exchange handshake a connection must complete before it may join
//! the exchange.
//!
//! [Handshake] is a plain state machine: every operation returns an
//! [Outcome] describing the frame to answer with, and the driver decides
//! how outcomes reach the wire. A connection is verified once three things
//! have happened in any order — the server key was sent, a client key was
//! received, and the verification code was sent encrypted to the client —
//! and the client then echoes the code back encrypted to the server.
//!
//! Out-of-order [Handshake::verify] calls are refused with specific error
//! messages; those strings are part of the wire contract and observable by
//! clients.

use crate::crypto::{LocalIdentity, RemoteKey};

/// Result of a single handshake operation.
#[derive(Debug)]
pub enum Outcome {
    /// The server is ready to start the exchange.
    Ready,
    /// The server public key, DER-encoded.
    ServerKey(Vec<u8>),
    /// The client public key was installed.
    KeyReceived,
    /// The verification code, encrypted with the client key.
    Verification(Vec<u8>),
    /// The operation was refused or failed; the message is client-visible.
    Error(String),
    /// The echoed verification code matched: the connection is trusted and
    /// these keys secure all further traffic.
    Verified {
        remote: RemoteKey,
        local: LocalIdentity,
    },
}

#[derive(Debug)]
enum Verification {
    NotSent,
    Sent(String),
}

#[derive(Debug)]
pub struct Handshake {
    local: LocalIdentity,
    server_key_sent: bool,
    client_key: Option<RemoteKey>,
    verification: Verification,
}

impl Handshake {
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            server_key_sent: false,
            client_key: None,
            verification: Verification::NotSent,
        }
    }

    pub fn signal_ready(&self) -> Outcome {
        Outcome::Ready
    }

    pub fn send_key(&mut self) -> Outcome {
        self.server_key_sent = true;
        Outcome::ServerKey(self.local.public_key_der().to_vec())
    }

    /// Install the client public key from a PEM string.
    ///
    /// A parse failure clears any previously installed key; a later
    /// successful call reinstalls it. Both paths reset the verification
    /// state, so the code must be requested (again) after the key is set.
    pub fn receive_key(&mut self, pem: &str) -> Outcome {
        self.verification = Verification::NotSent;
        match RemoteKey::from_pem(pem) {
            Ok(key) => {
                self.client_key = Some(key);
                Outcome::KeyReceived
            }
            Err(error) => {
                self.client_key = None;
                Outcome::Error(error.to_string())
            }
        }
    }

    /// Record `code` as sent and encrypt it for the client.
    ///
    /// The code counts as sent even when no client key is installed; the
    /// failing rung of the [Handshake::verify] ladder is the missing key,
    /// not the missing code.
    pub fn send_verification(&mut self, code: &str) -> Outcome {
        self.verification = Verification::Sent(code.to_string());
        let client_key = match &self.client_key {
            Some(key) => key,
            None => {
                return Outcome::Error(
                    "Error: Can not send a verification code without the client public key"
                        .to_string(),
                )
            }
        };
        match client_key.encrypt(code.as_bytes()) {
            Ok(ciphertext) => Outcome::Verification(ciphertext),
            Err(error) => Outcome::Error(error.to_string()),
        }
    }

    /// Check the echoed verification code.
    ///
    /// The preconditions are checked in a fixed order and the first failing
    /// one decides the error message.
    pub fn verify(&mut self, ciphertext: &[u8]) -> Outcome {
        let client_key = match &self.client_key {
            None if !self.server_key_sent => {
                return Outcome::Error(
                    "Verification not possible before keys have been exchanged".to_string(),
                )
            }
            None => {
                return Outcome::Error(
                    "Verification not possible before client key received".to_string(),
                )
            }
            Some(key) => key.clone(),
        };
        if !self.server_key_sent {
            return Outcome::Error("Verification not possible before server key sent".to_string());
        }
        let code = match &self.verification {
            Verification::Sent(code) => code.clone(),
            Verification::NotSent => {
                return Outcome::Error(
                    "Verification not possible before verification message sent".to_string(),
                )
            }
        };
        match self.local.decrypt(ciphertext) {
            Err(error) => Outcome::Error(format!("verification failed because [{}]", error)),
            Ok(plaintext) => {
                if String::from_utf8_lossy(&plaintext) == code {
                    Outcome::Verified {
                        remote: client_key,
                        local: self.local.clone(),
                    }
                } else {
                    Outcome::Error("verification failed".to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CODE: &str = "[d5b10f63-07ca-47e8-b6ba-e457dfb8153a]";

    fn handshake() -> Handshake {
        Handshake::new(LocalIdentity::generate().unwrap())
    }

    /// A client-side key pair: the identity plays the client, its PEM is
    /// what the client would submit.
    fn client_keys() -> (LocalIdentity, String) {
        let identity = LocalIdentity::generate().unwrap();
        let pem = identity.public_key_pem();
        (identity, pem)
    }

    fn error_message(outcome: Outcome) -> String {
        match outcome {
            Outcome::Error(message) => message,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn signal_ready() {
        assert!(matches!(handshake().signal_ready(), Outcome::Ready));
    }

    #[test]
    fn send_key_returns_public_key() {
        let mut handshake = handshake();
        match handshake.send_key() {
            Outcome::ServerKey(der) => {
                RemoteKey::from_spki_der(&der).unwrap();
            }
            other => panic!("expected server key, got {:?}", other),
        }
    }

    #[test]
    fn receive_key_installs_client_key() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        assert!(matches!(handshake.receive_key(&pem), Outcome::KeyReceived));
        assert!(matches!(
            handshake.send_verification(CODE),
            Outcome::Verification(_)
        ));
    }

    #[test]
    fn receive_key_failure_reports_parse_error() {
        let mut handshake = handshake();
        let message = error_message(handshake.receive_key("not a key"));
        assert_eq!(message, "Invalid PEM encoding");
    }

    #[test]
    fn send_verification_requires_client_key() {
        let mut handshake = handshake();
        let message = error_message(handshake.send_verification(CODE));
        assert_eq!(
            message,
            "Error: Can not send a verification code without the client public key"
        );
    }

    #[test]
    fn receive_key_failure_clears_installed_key() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        assert!(matches!(handshake.receive_key(&pem), Outcome::KeyReceived));
        assert!(matches!(handshake.receive_key("garbage"), Outcome::Error(_)));
        let message = error_message(handshake.send_verification(CODE));
        assert_eq!(
            message,
            "Error: Can not send a verification code without the client public key"
        );
    }

    #[test]
    fn receive_key_success_after_failure_rearms() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        assert!(matches!(handshake.receive_key("garbage"), Outcome::Error(_)));
        assert!(matches!(handshake.receive_key(&pem), Outcome::KeyReceived));
        assert!(matches!(
            handshake.send_verification(CODE),
            Outcome::Verification(_)
        ));
    }

    #[test]
    fn verify_before_any_key_exchange() {
        let mut handshake = handshake();
        let message = error_message(handshake.verify(&[1, 2, 3]));
        assert_eq!(
            message,
            "Verification not possible before keys have been exchanged"
        );
    }

    #[test]
    fn verify_before_client_key_received() {
        let mut handshake = handshake();
        handshake.send_key();
        let message = error_message(handshake.verify(&[1, 2, 3]));
        assert_eq!(message, "Verification not possible before client key received");
    }

    #[test]
    fn verify_before_server_key_sent() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        handshake.receive_key(&pem);
        let message = error_message(handshake.verify(&[1, 2, 3]));
        assert_eq!(message, "Verification not possible before server key sent");
    }

    #[test]
    fn verify_before_verification_sent() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        handshake.send_key();
        handshake.receive_key(&pem);
        let message = error_message(handshake.verify(&[1, 2, 3]));
        assert_eq!(
            message,
            "Verification not possible before verification message sent"
        );
    }

    #[test]
    fn verify_reports_decryption_failure() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        handshake.send_key();
        handshake.receive_key(&pem);
        handshake.send_verification(CODE);
        let message = error_message(handshake.verify(&[1, 2, 3]));
        assert_eq!(
            message,
            "verification failed because [Failed to decrypt message]"
        );
    }

    #[test]
    fn verify_rejects_wrong_code() {
        let (_, pem) = client_keys();
        let mut handshake = handshake();
        let server_key = match handshake.send_key() {
            Outcome::ServerKey(der) => RemoteKey::from_spki_der(&der).unwrap(),
            other => panic!("expected server key, got {:?}", other),
        };
        handshake.receive_key(&pem);
        handshake.send_verification(CODE);

        let echoed = server_key.encrypt(b"[not-the-code]").unwrap();
        let message = error_message(handshake.verify(&echoed));
        assert_eq!(message, "verification failed");
    }

    #[test]
    fn verify_accepts_the_echoed_code() {
        let (client, pem) = client_keys();
        let mut handshake = handshake();
        let server_key = match handshake.send_key() {
            Outcome::ServerKey(der) => RemoteKey::from_spki_der(&der).unwrap(),
            other => panic!("expected server key, got {:?}", other),
        };
        handshake.receive_key(&pem);
        let ciphertext = match handshake.send_verification(CODE) {
            Outcome::Verification(ciphertext) => ciphertext,
            other => panic!("expected verification, got {:?}", other),
        };

        // The client decrypts the code and echoes it encrypted for the
        // server.
        let code = client.decrypt(&ciphertext).unwrap();
        assert_eq!(code, CODE.as_bytes());
        let echoed = server_key.encrypt(&code).unwrap();

        match handshake.verify(&echoed) {
            Outcome::Verified { remote, local } => {
                let roundtrip = remote.encrypt(b"ping").unwrap();
                assert_eq!(client.decrypt(&roundtrip).unwrap(), b"ping");
                assert_eq!(local.public_key_der(), handshake.local.public_key_der());
            }
            other => panic!("expected verified, got {:?}", other),
        }
    }
}
