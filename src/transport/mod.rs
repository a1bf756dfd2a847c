//! Getting frames to and from the bus.
//!
//! Two backends share the [`Transport`] trait. A [`SocketTransport`] answers
//! every request with a reply, inline. A [`BrokerTransport`] only publishes,
//! and frames arrive later through the receive handler. Callers branch on
//! [`Transport::delivery`], never on the concrete type.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    config::{Endpoint, Topics},
    protocol::{DecodeError, UnitId},
};

pub mod broker;
pub mod socket;

pub use broker::{BrokerTransport, InboundRouter, Routed};
pub use socket::SocketTransport;


#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed {
        endpoint: String,
        reason: String,
    },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("transport is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("connection closed without a reply")]
    NoReply,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload {
        topic: String,
        reason: String,
    },

    #[error("frame not encoded: {0}")]
    Encode(#[from] DecodeError),
}


/// How frames sent on a transport are answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Each send returns the reply.
    Reply,

    /// Replies arrive through the receive handler, if at all.
    Push,
}


/// Successful outcome of [`Transport::send`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivered {
    Reply(Bytes),
    Published,
}


/// A frame pushed by the bus, already attributed to a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub unit_id: UnitId,
    pub payload: Bytes,
}

pub type ReceiveHandler = Arc<dyn Fn(Inbound) + Send + Sync>;


#[async_trait]
pub trait Transport: Send + Sync {
    fn delivery(&self) -> Delivery;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn send(&self, frame: Bytes) -> Result<Delivered, TransportError>;

    fn set_receive_handler(&self, handler: ReceiveHandler);

    /// Drop anything remembered about the last frame seen from `unit_id`,
    /// so the next one is delivered even if it repeats it.
    fn forget(&self, _unit_id: UnitId) {}
}


/// Build the transport for `endpoint`.
pub fn open(endpoint: &Endpoint, units: &[UnitId], topics: &Topics, timeout: Duration) -> Arc<dyn Transport> {
    match endpoint {
        Endpoint::Socket { host, port } => {
            Arc::new(SocketTransport::new(host, *port, timeout))
        },
        Endpoint::Broker { host, port, credentials } => {
            let options = broker::mqtt_options(host, *port, credentials.clone());
            Arc::new(BrokerTransport::new(options, topics.clone(), units, timeout))
        }
    }
}
