//! RSA identities used by the handshake and the encrypted connection.
//!
//! The server generates a fresh [LocalIdentity] per connection and clients
//! submit their public key as PEM, parsed into a [RemoteKey]. Both
//! directions use OAEP with SHA-256.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

const KEY_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to generate RSA key pair")]
    Generate(#[source] rsa::errors::Error),
    #[error("Failed to encode public key")]
    EncodePublicKey(#[source] rsa::pkcs8::spki::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("Invalid PEM encoding")]
    Pem(#[source] base64::DecodeError),
    #[error("Unsupported public key encoding")]
    Der(#[source] rsa::pkcs8::spki::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Failed to encrypt message")]
    Encrypt(#[source] rsa::errors::Error),
    #[error("Failed to decrypt message")]
    Decrypt(#[source] rsa::errors::Error),
}

/// A local RSA key pair with the SPKI encoding of its public half.
#[derive(Clone)]
pub struct LocalIdentity {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl LocalIdentity {
    pub fn generate() -> Result<Self, IdentityError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(IdentityError::Generate)?;
        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(IdentityError::EncodePublicKey)?
            .into_vec();
        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// DER (SPKI) encoding of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// PEM rendering of [LocalIdentity::public_key_der].
    pub fn public_key_pem(&self) -> String {
        let encoded = base64::encode(&self.public_key_der);
        let mut pem = String::from("-----BEGIN RSA PUBLIC KEY-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            // Chunking base64 output never splits a UTF-8 sequence.
            pem.push_str(std::str::from_utf8(chunk).unwrap_or(""));
            pem.push('\n');
        }
        pem.push_str("-----END RSA PUBLIC KEY-----\n");
        pem
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(CipherError::Decrypt)
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("LocalIdentity").finish_non_exhaustive()
    }
}

/// A peer's RSA public key.
#[derive(Debug, Clone)]
pub struct RemoteKey {
    public_key: RsaPublicKey,
}

impl RemoteKey {
    /// Parse a PEM-encoded public key, trying PKCS#1 first and SPKI second.
    ///
    /// The PEM label is ignored: clients in the wild send SPKI bodies under
    /// an `RSA PUBLIC KEY` header and vice versa.
    pub fn from_pem(pem: &str) -> Result<Self, KeyParseError> {
        let body = pem
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with("-----"))
            .collect::<String>();
        let der = base64::decode(&body).map_err(KeyParseError::Pem)?;
        if let Ok(public_key) = RsaPublicKey::from_pkcs1_der(&der) {
            return Ok(Self { public_key });
        }
        let public_key = RsaPublicKey::from_public_key_der(&der).map_err(KeyParseError::Der)?;
        Ok(Self { public_key })
    }

    /// Parse the DER (SPKI) encoding emitted by [LocalIdentity::public_key_der].
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyParseError> {
        let public_key = RsaPublicKey::from_public_key_der(der).map_err(KeyParseError::Der)?;
        Ok(Self { public_key })
    }

    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), message)
            .map_err(CipherError::Encrypt)
    }
}
