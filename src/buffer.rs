//! Output buffer ownership
//!
//! Every byte payload the core hands out (result documents, cropped images,
//! score vectors) is wrapped in a move-only [`OutputBuffer`] carrying a
//! provenance ticket. The ledger records every outstanding ticket; release
//! is a checked operation that fails closed on anything the ledger does not
//! recognize instead of trusting the caller.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::error::{FacegateError, Result};

/// Provenance tag of a core-issued buffer. Callers that move the bytes out
/// of an [`OutputBuffer`] keep the ticket and release through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTicket(Uuid);

/// A core-allocated byte payload whose ownership has transferred to the
/// caller. Move-only on purpose: there is exactly one value to hand back.
#[derive(Debug)]
pub struct OutputBuffer {
    ticket: BufferTicket,
    bytes: Vec<u8>,
}

impl OutputBuffer {
    pub fn ticket(&self) -> BufferTicket {
        self.ticket
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Split into the raw payload and the ticket needed to release it.
    /// Mirrors the foreign-boundary handover where the pointer and the
    /// obligation to free it travel separately.
    pub fn into_parts(self) -> (BufferTicket, Vec<u8>) {
        (self.ticket, self.bytes)
    }
}

/// Process-wide table of outstanding buffer tickets.
#[derive(Debug, Default)]
pub struct BufferLedger {
    outstanding: Mutex<HashSet<BufferTicket>>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `bytes` in a tracked buffer. The ticket stays outstanding until
    /// released exactly once.
    pub fn issue(&self, bytes: Vec<u8>) -> OutputBuffer {
        let ticket = BufferTicket(Uuid::new_v4());
        self.outstanding.lock().insert(ticket);
        trace!(?ticket, len = bytes.len(), "issued output buffer");
        OutputBuffer { ticket, bytes }
    }

    /// Release a buffer produced by any call through this library.
    pub fn release(&self, buffer: OutputBuffer) -> Result<()> {
        self.release_ticket(buffer.ticket)
    }

    /// Release by ticket, for callers that already consumed the bytes.
    /// Unknown and already-released tickets are rejected, never reclaimed.
    pub fn release_ticket(&self, ticket: BufferTicket) -> Result<()> {
        if self.outstanding.lock().remove(&ticket) {
            trace!(?ticket, "released output buffer");
            Ok(())
        } else {
            Err(FacegateError::BufferProvenance)
        }
    }

    /// Number of buffers issued and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}
