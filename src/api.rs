// Application and hardware facing interfaces of a bus endpoint.
// Numan Thabit 2025
use bytes::Bytes;
use thiserror::Error;

use crate::{
    metrics::LinkStats,
    network::NodeBitmap,
    wire::{NodeId, Packet, PAYLOAD_CAPACITY},
};

/// Error surfaced by [`BusEndpoint::submit_tx`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Declared length does not fit a single packet.
    #[error("payload of {len} bytes exceeds the {max} byte capacity")]
    PayloadTooLarge {
        /// Requested length.
        len: usize,
        /// Payload capacity of one packet.
        max: usize,
    },
}

impl TxError {
    pub(crate) fn check_len(len: usize) -> Result<(), Self> {
        if len > PAYLOAD_CAPACITY {
            Err(TxError::PayloadTooLarge {
                len,
                max: PAYLOAD_CAPACITY,
            })
        } else {
            Ok(())
        }
    }
}

/// A payload handed to the application together with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Endpoint the payload came from.
    pub src: NodeId,
    /// Payload bytes.
    pub payload: Bytes,
}

/// Buffers the physical layer should use for the next transfer.
#[derive(Debug)]
pub struct SlotBuffers<'a> {
    /// Packet to drive onto the bus, `None` when this endpoint stays silent.
    pub tx: Option<&'a Packet>,
    /// Buffer the incoming packet lands in.
    pub rx: &'a mut Packet,
}

/// Upper-layer view of an endpoint. Every call is non-blocking.
pub trait BusEndpoint {
    /// Reserves the payload area of the next packet to `dest`.
    ///
    /// Returns `None` when buffers are exhausted or `dest` cannot be reached; retry later.
    fn allocate_tx(&mut self, dest: NodeId) -> Option<&mut [u8]>;

    /// Publishes the packet reserved by [`BusEndpoint::allocate_tx`] with `len` payload bytes.
    ///
    /// Panics when no reservation for `dest` is outstanding.
    fn submit_tx(&mut self, dest: NodeId, len: usize) -> Result<(), TxError>;

    /// Oldest undelivered payload and its source.
    fn peek_rx(&self) -> Option<(&[u8], NodeId)>;

    /// Releases the payload returned by [`BusEndpoint::peek_rx`].
    fn pop_rx(&mut self) -> bool;

    /// Payloads waiting for the application.
    fn pending_rx(&self) -> usize;

    /// Feeds elapsed time from the hardware timer.
    fn advance_time(&mut self, micros: u32);

    /// Identities this endpoint currently considers connected.
    fn connected_nodes_bitmap(&self) -> NodeBitmap;

    /// Copies out and releases the oldest undelivered payload.
    fn take_rx(&mut self) -> Option<ReceivedFrame> {
        let frame = self.peek_rx().map(|(data, src)| ReceivedFrame {
            src,
            payload: Bytes::copy_from_slice(data),
        })?;
        self.pop_rx();
        Some(frame)
    }

    /// Copies `payload` into a fresh packet for `dest` and submits it.
    ///
    /// Returns `Ok(false)` when no buffer was available.
    fn send(&mut self, dest: NodeId, payload: &[u8]) -> Result<bool, TxError> {
        TxError::check_len(payload.len())?;
        let Some(buf) = self.allocate_tx(dest) else {
            return Ok(false);
        };
        buf[..payload.len()].copy_from_slice(payload);
        self.submit_tx(dest, payload.len())?;
        Ok(true)
    }
}

/// Per-slot pipeline driven from the transfer-complete interrupt.
pub trait SlotEngine {
    /// Validates the packet that just landed and selects the next transmission.
    ///
    /// `corrupted` is the physical layer's verdict on the finished transfer.
    fn pre_process(&mut self, corrupted: bool);

    /// Applies the validated packet and prepares future slots.
    fn post_process(&mut self);

    /// Packet to transmit in the upcoming slot, if any.
    fn tx_frame(&self) -> Option<&Packet>;

    /// Buffer the upcoming slot's packet should be received into.
    fn rx_frame_mut(&mut self) -> &mut Packet;

    /// Both buffers at once, for handing to the physical layer.
    fn slot_buffers(&mut self) -> SlotBuffers<'_>;

    fn is_tx_slot(&self) -> bool {
        self.tx_frame().is_some()
    }

    fn stats(&self) -> &LinkStats;
}

/// Physical transport collaborator, typically SPI with DMA.
pub trait Phy {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Drives the framing line that marks slot boundaries.
    fn set_framing_signal(&mut self, high: bool);

    /// Starts a full-packet transfer. Completion is reported back via the driver.
    fn start_transfer(&mut self, tx: Option<&Packet>, rx: &mut Packet) -> Result<(), Self::Error>;
}
