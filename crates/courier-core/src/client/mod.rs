//! Client side of the broker.
//!
//! A [`ClientConnection`] owns one socket. Requests are written by the caller
//! and answered through the [`ChannelListener`], which also routes
//! subscription deliveries to their topic handlers.

pub mod connection;
pub mod listener;

pub use connection::{check_status, ClientConnection, ClientStatistics};
pub use listener::{ChannelListener, ListenerStatistics, ListenerStop, SubscriptionHandler};
