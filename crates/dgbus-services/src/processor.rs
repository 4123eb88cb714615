//! Per-datagram pipeline: parse, reassemble, decode, dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use dgbus_core::message::DeserializeError;
use dgbus_core::{DecodeError, Message, Packet, PacketBody, PayloadDecoder};

use crate::ledger::{Assembled, LedgerError, ReassemblyKey, ReassemblyLedger};
use crate::router::DispatchRouter;
use crate::stats::DeliveryStats;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("message {key} dropped: {source}")]
    DeserializeFailed {
        key: ReassemblyKey,
        #[source]
        source: DeserializeError,
    },
}

pub struct DatagramProcessor {
    ledger: Arc<ReassemblyLedger>,
    router: Arc<DispatchRouter>,
    decoder: Arc<dyn PayloadDecoder>,
    stats: Arc<DeliveryStats>,
}

impl DatagramProcessor {
    pub fn new(
        ledger: Arc<ReassemblyLedger>,
        router: Arc<DispatchRouter>,
        decoder: Arc<dyn PayloadDecoder>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            ledger,
            router,
            decoder,
            stats,
        }
    }

    pub fn ledger(&self) -> &Arc<ReassemblyLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// Process one datagram from `origin`.
    ///
    /// Returns the completed message if this packet finished one, after it
    /// has been handed to the router. `Ok(None)` means more packets are
    /// expected.
    pub async fn process(
        &self,
        raw: &[u8],
        origin: SocketAddr,
    ) -> Result<Option<Arc<Message>>, ProcessError> {
        let packet = Packet::parse(raw)?;
        let key = ReassemblyKey::new(origin, packet.message_id);
        let contiguous = packet.contiguous;

        let assembled = match packet.body {
            PacketBody::Start { topic, chunk } if !contiguous => Assembled::single(topic, chunk),
            PacketBody::Start { topic, chunk } => {
                self.ledger.on_start(key, topic, chunk)?;
                return Ok(None);
            }
            PacketBody::Data { seq, chunk } => {
                match self.ledger.on_data(key, seq, chunk, !contiguous).await? {
                    Some(assembled) => assembled,
                    None => return Ok(None),
                }
            }
        };

        let properties = self
            .decoder
            .decode(&assembled.payload)
            .map_err(|source| ProcessError::DeserializeFailed { key, source })?;
        let message = Arc::new(Message::new(assembled.topic, properties, assembled.payload));
        self.stats.record_completed();

        let handlers = self.router.handlers_for(&message.topic);
        if handlers.is_empty() {
            tracing::trace!(topic = %message.topic, "no subscribers");
            self.stats.record_unrouted();
        } else {
            let count = self.router.dispatch(message.clone(), handlers);
            tracing::debug!(topic = %message.topic, key = %key, handlers = count, "message dispatched");
        }
        Ok(Some(message))
    }

    /// `process`, with every failure logged and counted instead of returned.
    pub async fn handle_datagram(&self, raw: &[u8], origin: SocketAddr) {
        self.stats.record_packet();
        let Err(e) = self.process(raw, origin).await else {
            return;
        };
        match &e {
            ProcessError::Decode(_) => {
                self.stats.record_decode_failure();
                tracing::debug!(
                    origin = %origin,
                    prefix = hex::encode(&raw[..raw.len().min(8)]),
                    error = %e,
                    "dropping packet"
                );
            }
            ProcessError::DeserializeFailed { .. } => {
                self.stats.record_deserialize_failure();
                tracing::warn!(origin = %origin, error = %e, "dropping message");
            }
            ProcessError::Ledger(LedgerError::Abandoned(_)) => {
                tracing::debug!(origin = %origin, error = %e, "reassembly abandoned");
            }
            ProcessError::Ledger(_) => {
                self.stats.record_protocol_error();
                tracing::warn!(origin = %origin, error = %e, "protocol error");
            }
        }
    }
}
