//! Control frames and inbound frame classification.
//!
//! A channel carries two kinds of traffic over the same transport: raw
//! terminal bytes and small JSON control objects discriminated by a `type`
//! field. Classification is deterministic:
//!
//! - binary transport frames are always raw input and are never parsed;
//! - a text frame is a control frame only when the *whole* payload parses as
//!   a JSON object with a recognized `type` and valid fields;
//! - everything else, including text that merely starts like a control
//!   object, is raw input and must be forwarded verbatim.
//!
//! Outbound process output is never classified.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};

/// A type-tagged control message carried on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Terminal viewport change.
    Resize {
        /// Terminal width in columns.
        cols: u16,
        /// Terminal height in rows.
        rows: u16,
    },
    /// Client-side theme change. Informational only; the payload beyond the
    /// tag is kept but never interpreted by the server.
    Theme {
        #[serde(flatten)]
        settings: Map<String, Value>,
    },
}

impl ControlFrame {
    /// Builds a resize frame.
    pub fn resize(cols: u16, rows: u16) -> Self {
        ControlFrame::Resize { cols, rows }
    }

    /// Serializes the frame into the JSON text sent over the channel.
    pub fn to_json(&self) -> Result<String> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses a control frame from JSON text.
    ///
    /// Fails for anything that is not a complete, valid control object.
    pub fn from_json(text: &str) -> Result<Self> {
        let frame: ControlFrame = serde_json::from_str(text)?;
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<()> {
        if let ControlFrame::Resize { cols, rows } = self {
            if *cols == 0 || *rows == 0 {
                return Err(ProtocolError::InvalidControlFrame(format!(
                    "resize dimensions must be non-zero, got {}x{}",
                    cols, rows
                )));
            }
        }
        Ok(())
    }
}

/// Transport-level frame type as reported by the websocket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// Result of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A recognized control frame.
    Control(ControlFrame),
    /// Raw terminal input to be written to the process unchanged.
    Input(&'a [u8]),
}

/// Classifies a single inbound frame.
pub fn classify(kind: FrameKind, payload: &[u8]) -> Inbound<'_> {
    if kind == FrameKind::Binary || !looks_like_object(payload) {
        return Inbound::Input(payload);
    }

    match std::str::from_utf8(payload)
        .ok()
        .and_then(|text| ControlFrame::from_json(text).ok())
    {
        Some(frame) => Inbound::Control(frame),
        None => Inbound::Input(payload),
    }
}

/// Cheap pre-filter: only payloads whose first non-whitespace byte opens a
/// JSON object can possibly be control frames.
fn looks_like_object(payload: &[u8]) -> bool {
    payload
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}
