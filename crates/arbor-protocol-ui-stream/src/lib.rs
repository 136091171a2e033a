//! Typed UI message stream protocol.
//!
//! One agent turn is streamed to the client as a sequence of typed JSON
//! records over SSE: `start`, text/reasoning deltas, tool lifecycle
//! records, step boundaries, custom `data-<name>` records, and a terminal
//! `finish`. Records are the live feed only; what ends up in history is
//! decided by the [`StreamFrame`] persistence tag, not by the wire shape.

mod events;
mod frame;
mod sse;

pub use events::{finish_reason, UiStreamEvent};
pub use frame::StreamFrame;
pub use sse::{parse_frame, parse_sse_line, sse_frame, ParsedFrame};
