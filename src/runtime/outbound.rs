//! Per-session outbound queue.
//!
//! Holds encoded chunks in send order, byte-accounted against the
//! configured capacity. The queue also owns the write gate: a single flag
//! taken by the first offer into an idle queue and released by the worker
//! once a completed write finds nothing left to send. At most one write
//! is in flight per session.
//!
//! ## Flow Control
//!
//! ```text
//! pending > high watermark  -> flow limited (session stops reading)
//! pending < low watermark   -> released    (session resumes reading)
//! ```
//!
//! Offers past capacity are accepted, never dropped; the read suspension is
//! what bounds growth.

use crate::runtime::buffer::{BufferArena, Chunk};
use std::collections::VecDeque;

/// What the caller of [`OutboundQueue::offer`] has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    /// The gate was free and is now held; the caller must start a flush.
    pub start_write: bool,
    /// This offer pushed the queue above the high watermark.
    pub flow_limited: bool,
}

/// Ordered write buffers with a binary write gate.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Chunk>,
    /// Bytes queued or in flight.
    pending: usize,
    capacity: usize,
    high: usize,
    low: usize,
    coalesce_threshold: usize,
    writing: bool,
    flow_limited: bool,
}

impl OutboundQueue {
    /// Create a queue of `capacity` bytes with fractional watermarks.
    pub fn new(
        capacity: usize,
        high_watermark: f64,
        low_watermark: f64,
        coalesce_threshold: usize,
    ) -> Self {
        Self {
            items: VecDeque::new(),
            pending: 0,
            capacity,
            high: (capacity as f64 * high_watermark) as usize,
            low: (capacity as f64 * low_watermark) as usize,
            coalesce_threshold,
            writing: false,
            flow_limited: false,
        }
    }

    /// Append a chunk, taking the gate if it is free.
    pub fn offer(&mut self, chunk: Chunk) -> Offer {
        self.pending += chunk.len();
        self.items.push_back(chunk);

        let start_write = !self.writing;
        self.writing = true;

        let flow_limited = !self.flow_limited && self.pending > self.high;
        if flow_limited {
            self.flow_limited = true;
        }

        Offer {
            start_write,
            flow_limited,
        }
    }

    /// Take the next buffer to write, coalescing small neighbours.
    ///
    /// Returns `None` and releases the gate when the queue is empty.
    /// Coalesced chunks are allocated from `arena` near page `hint`.
    pub fn next_batch(&mut self, arena: &BufferArena, hint: usize) -> Option<Chunk> {
        let Some(first) = self.items.pop_front() else {
            self.writing = false;
            return None;
        };

        let mut total = first.len();
        let mut count = 0;
        for next in &self.items {
            if total + next.len() > self.coalesce_threshold {
                break;
            }
            total += next.len();
            count += 1;
        }
        if count == 0 {
            return Some(first);
        }

        let mut merged = arena.allocate_near(hint, total);
        let mut offset = first.len();
        merged[..offset].copy_from_slice(&first);
        for chunk in self.items.drain(..count) {
            merged[offset..offset + chunk.len()].copy_from_slice(&chunk);
            offset += chunk.len();
        }
        Some(merged)
    }

    /// Account for a finished write of `len` bytes.
    ///
    /// Returns `true` if this completion released the flow limit. An empty
    /// queue always releases, whatever the low watermark rounded to.
    pub fn complete(&mut self, len: usize) -> bool {
        self.pending = self.pending.saturating_sub(len);
        if self.flow_limited && (self.pending < self.low || self.pending == 0) {
            self.flow_limited = false;
            return true;
        }
        false
    }

    /// Drop every queued chunk and release the gate.
    pub fn clear(&mut self) {
        self.items.clear();
        self.pending = 0;
        self.writing = false;
        self.flow_limited = false;
    }

    /// No write in flight and nothing queued.
    pub fn is_idle(&self) -> bool {
        !self.writing && self.items.is_empty()
    }

    pub fn is_flow_limited(&self) -> bool {
        self.flow_limited
    }

    /// Pending bytes as a fraction of capacity (may exceed 1.0).
    pub fn occupancy(&self) -> f64 {
        self.pending as f64 / self.capacity as f64
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// Number of queued (not in flight) chunks.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
