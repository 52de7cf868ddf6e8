// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types reported by the harness.
//!
//! Wire-visible failures (no frame arrived, frames arrived but none matched)
//! are ordinary recoverable errors that a test decides how to treat.
//! Mismatch and close failures aggregate every underlying cause rather than
//! surfacing only the first one.

use core::fmt;
use std::io;

use thiserror::Error;

use crate::layers::Layers;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed address, unknown interface or similar startup problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket creation, transmission or reception failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A layer could not be merged, serialized or applied to state.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// The expectation deadline passed without a single candidate frame.
    #[error("got no frames")]
    NoFrames,

    /// The expectation deadline passed; every received frame was rejected.
    #[error(transparent)]
    Mismatch(#[from] MismatchError),

    /// One or more resources failed to release.
    #[error(transparent)]
    Close(#[from] CloseError),
}

/// Failures of per-layer operations: merging, serialization and
/// connection-state updates.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("cannot merge a {found} layer into a {expected} layer")]
    MergeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{layer}: {field} is unspecified and cannot be computed")]
    MissingField {
        layer: &'static str,
        field: &'static str,
    },

    #[error("{layer}: {field} has an impossible value ({reason})")]
    InvalidField {
        layer: &'static str,
        field: &'static str,
        reason: &'static str,
    },

    #[error("{layer}: checksum requires an enclosing Ipv4 layer")]
    MissingEnclosing { layer: &'static str },

    #[error("{layer}: cannot update connection state from a {found} layer")]
    StateMismatch {
        layer: &'static str,
        found: &'static str,
    },

    #[error("expectation layer at index {index} cannot be aligned with the frame")]
    Unaligned { index: usize },
}

/// One rejected candidate frame: what arrived and what was wanted.
#[derive(Clone, Debug)]
pub struct LayersError {
    pub got: Layers,
    pub want: Layers,
}

impl fmt::Display for LayersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame did not match:\n{}", self.want.diff(&self.got))
    }
}

/// Every candidate frame rejected before an expectation deadline expired.
#[derive(Debug, Default)]
pub struct MismatchError {
    pub rejections: Vec<LayersError>,
}

impl fmt::Display for MismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} candidate frame(s) received, none matched:",
            self.rejections.len()
        )?;
        for (i, rejection) in self.rejections.iter().enumerate() {
            write!(f, "[{}] {}", i, rejection)?;
        }
        Ok(())
    }
}

impl std::error::Error for MismatchError {}

/// Aggregated failures from releasing a connection's resources.
#[derive(Debug, Default)]
pub struct CloseError {
    pub errors: Vec<Error>,
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) while closing:", self.errors.len())?;
        for err in &self.errors {
            write!(f, " {};", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}
