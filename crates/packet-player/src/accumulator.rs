//! Packet accumulation into pool slots.
//!
//! Decoded packets are copied back-to-back into the active slot; a
//! descriptor table records each packet's (offset, length) so the output
//! device can recover packet boundaries. A buffer is considered full when
//! the next packet would overflow its byte capacity or when the descriptor
//! table reaches its fixed maximum, whichever happens first.

use crate::pool::Slot;

/// Location of one decoded packet inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Byte offset of the packet within the buffer.
    pub offset: usize,
    /// Packet length in bytes.
    pub len: usize,
}

/// A filled buffer ready for the output device.
#[derive(Debug)]
pub struct FilledBuffer {
    /// The slot carrying the packet bytes. Ownership travels with this value.
    pub slot: Slot,
    /// Packet boundaries, in accumulation order. Offsets are monotonically
    /// increasing and non-overlapping.
    pub descriptors: Vec<PacketDescriptor>,
    /// Valid bytes in the slot (`slot.data()[..byte_count]`).
    pub byte_count: usize,
}

struct FillState {
    slot: Slot,
    fill: usize,
    descriptors: Vec<PacketDescriptor>,
}

/// Builds filled buffers out of a stream of decoded packets.
///
/// Holds at most one active slot. The caller (the decode context) drives
/// the flush-then-acquire cycle; the accumulator itself never touches the
/// pool, which keeps it trivially testable.
pub struct PacketAccumulator {
    max_descriptors: usize,
    active: Option<FillState>,
}

impl PacketAccumulator {
    pub fn new(max_descriptors: usize) -> Self {
        Self {
            max_descriptors,
            active: None,
        }
    }

    /// Whether a slot is currently being filled.
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Whether a packet of `len` bytes fits the active slot.
    ///
    /// `false` when there is no active slot, when remaining byte capacity is
    /// insufficient, or when the descriptor table is already full.
    pub fn fits(&self, len: usize) -> bool {
        match &self.active {
            Some(state) => {
                state.descriptors.len() < self.max_descriptors
                    && state.fill + len <= state.slot.capacity()
            }
            None => false,
        }
    }

    /// Start filling a freshly acquired slot.
    ///
    /// The caller must have flushed (or never started) the previous buffer.
    pub fn begin(&mut self, slot: Slot) {
        debug_assert!(self.active.is_none(), "begin with an active buffer");
        self.active = Some(FillState {
            slot,
            fill: 0,
            descriptors: Vec::with_capacity(self.max_descriptors),
        });
    }

    /// Copy one packet into the active slot and record its descriptor.
    ///
    /// Precondition: `fits(payload.len())`; the caller checks before calling.
    pub fn append(&mut self, payload: &[u8]) {
        debug_assert!(self.fits(payload.len()), "append without room");
        let Some(state) = self.active.as_mut() else {
            return;
        };

        let offset = state.fill;
        state.slot.data_mut()[offset..offset + payload.len()].copy_from_slice(payload);
        state.descriptors.push(PacketDescriptor {
            offset,
            len: payload.len(),
        });
        state.fill += payload.len();
    }

    /// Hand off the active buffer, if it carries any packet.
    ///
    /// An active-but-empty slot is returned as a zero-descriptor
    /// `FilledBuffer` only when it holds data; an untouched slot yields
    /// `None` and stays active so the caller can decide to recycle it.
    pub fn take_filled(&mut self) -> Option<FilledBuffer> {
        self.active
            .take_if(|state| state.fill > 0)
            .map(|state| FilledBuffer {
                slot: state.slot,
                descriptors: state.descriptors,
                byte_count: state.fill,
            })
    }

    /// Drop the active slot without flushing, returning it for release.
    pub fn take_slot(&mut self) -> Option<Slot> {
        self.active.take().map(|state| state.slot)
    }

    /// Descriptors accumulated into the active buffer so far.
    pub fn pending_descriptors(&self) -> usize {
        self.active
            .as_ref()
            .map(|state| state.descriptors.len())
            .unwrap_or(0)
    }
}
