//! A message-relay hub for long-lived duplex client connections.
//!
//! Every connection goes through an RSA key-exchange handshake; once
//! verified it is wrapped in an end-to-end encrypted connection and bound
//! to a mailbox on the in-process [exchange::Exchange], through which
//! clients address each other by opaque id.

#![warn(missing_debug_implementations)]
pub mod crypto;
pub mod encrypted;
pub mod exchange;
pub mod handshake;
mod hub;
pub mod socket;
pub mod wire;

#[doc(inline)]
pub use hub::Hub;
