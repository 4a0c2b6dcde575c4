//! Streaming table sink. Route messages carry rows produced for a processor; rows are buffered per
//! destination table and written in batches, either when the batch is full or when the batch
//! window elapses. Every inbound message ends in exactly one ack or nak, and the outcome is
//! reported on the monitor route.
//!
//! Transport, metadata backend, relational store and monitor route are reached through the
//! [message::TransportMessage], [metadata::MetadataLookup], [storage::Storage] and
//! [status::StatusPublisher] traits, the adapters live in their own crates.

pub use crate::error::{Error, Result};

mod error;
pub use crate::error::{default_is_terminal, retry_lookup_is_terminal};

/// Table processor configuration parsed from the processor properties, and the flush policy built
/// from it.
pub mod config;

/// Inbound route messages, outbound monitor messages and the transport message seam.
pub mod message;

/// Identifiers, SQL building and the storage driver seam.
pub mod storage;

pub mod status;

pub mod metadata;

/// Per-destination batch buffer with size and time flush triggers.
pub mod buffer;

pub mod registry;

pub mod finalizer;

pub mod handler;

#[cfg(test)]
mod test_utils;
