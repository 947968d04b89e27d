//! Transport bridge.
//!
//! The engine never talks to the network itself. A transport receives a
//! pull-based stream of encoded outbound messages and hands back a stream of
//! raw inbound messages, classifying its own failures as [`TransportError`].

use crate::codec;
use crate::error::TransportError;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tracing::error;

/// Encoded outbound messages, in enqueue order. Ends when the session closes.
pub type OutboundStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Raw inbound messages from the inference service.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A duplex connection to the inference service.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// Opens the bidirectional stream for `session_id`.
    ///
    /// The transport should pull from `outbound` for as long as it yields and
    /// forward every item to the service.
    async fn open(
        &self,
        session_id: &str,
        outbound: OutboundStream,
    ) -> Result<InboundStream, TransportError>;
}

/// Adapts a session's outbound queue into the stream a transport pulls from.
///
/// An event that fails to encode ends the stream rather than sending
/// something the service cannot parse.
pub(crate) fn outbound_stream(session: Arc<Session>) -> OutboundStream {
    Box::pin(futures::stream::unfold(session, |session| async move {
        let event = session.next_outbound().await?;
        match codec::encode(&event) {
            Ok(bytes) => Some((bytes, session)),
            Err(e) => {
                error!(
                    session_id = %session.id,
                    kind = event.kind(),
                    error = ?e,
                    "Failed to encode outbound event, ending stream"
                );
                None
            }
        }
    }))
}
