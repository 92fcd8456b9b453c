//! Host: the socket owner that turns datagrams into peer traffic and events.
//!
//! A [`Host`] binds one UDP socket and owns every [`Peer`](crate::transport::Peer)
//! it connects to or accepts. Receive threads classify each datagram:
//!
//! - `Connected`, `Accept` and `Reject` packets go to the peer registered
//!   for the sender's address
//! - a `Request` from an unknown address becomes a [`ConnectionRequest`]
//!   event the application answers with [`Host::accept`] or [`Host::reject`]
//! - `Unconnected` and `Broadcast` packets are delivered as-is
//!
//! Everything the application needs to know arrives as a [`HostEvent`] on
//! the bounded queue returned by [`Host::new`].

#[allow(clippy::module_inception)]
mod host;
mod events;
mod request;
mod simulator;

pub use events::{HostEvent, HostEvents, PeerId};
pub use host::Host;
pub use request::ConnectionRequest;
pub use simulator::{Delayed, Flow, Simulator, Verdict};
