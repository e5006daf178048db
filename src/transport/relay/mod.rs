//! TCP rendezvous relay.
//!
//! Devices on different networks cannot dial each other directly, so both
//! ends connect out to a [`RendezvousServer`] that pairs a dial with the
//! registered identity and splices the two sockets together. [`RelayBroker`]
//! is the client side of that exchange.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RelayBroker;
pub use server::RendezvousServer;
