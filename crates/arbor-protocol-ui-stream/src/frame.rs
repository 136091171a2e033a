//! Persistence tagging for stream records.

use crate::events::UiStreamEvent;

/// A stream record plus its persistence fate.
///
/// `Transient` records reach the client like any other but are excluded
/// when the turn's final parts are derived; repeated sub-agent poll
/// results stay visible live without bloating stored history.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Persisted(UiStreamEvent),
    Transient(UiStreamEvent),
}

impl StreamFrame {
    pub fn event(&self) -> &UiStreamEvent {
        match self {
            StreamFrame::Persisted(event) | StreamFrame::Transient(event) => event,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StreamFrame::Transient(_))
    }

    /// Unwrap into the wire record, stamping `transient: true` onto
    /// transient `data-*` records so clients can tell live-only content
    /// apart.
    pub fn into_wire(self) -> UiStreamEvent {
        match self {
            StreamFrame::Persisted(event) => event,
            StreamFrame::Transient(event) => match event {
                UiStreamEvent::Data {
                    data_type, data, ..
                } => UiStreamEvent::Data {
                    data_type,
                    data,
                    transient: true,
                },
                other => other,
            },
        }
    }
}
