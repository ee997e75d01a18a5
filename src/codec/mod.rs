//! Binary row codec
//!
//! Typed, null-aware encode/decode of heterogeneous table rows. Both the
//! base table rows folded by the aggregator and the compact bucket rows it
//! writes to the aggregate table use this format.
//!
//! # Row Format
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────────┐
//! │  Null bitmap  │  Column payloads (non-null columns in order) │
//! │  ⌈ncols/8⌉ B  │  fixed width, or u32 length + bytes          │
//! └───────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All numeric payloads are explicit little-endian, so rows written on one
//! architecture decode identically on any other.

mod row;

pub use row::{RowBuilder, RowView};
