//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use thiserror::Error;

/// Errors surfaced by the engine. Capture-time errors have their own type
/// (`capture::CaptureError`) because the worker reacts to them frame by
/// frame instead of propagating them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown despeckle operator '{0}' (expected one of E e D d l)")]
    Despeckle(char),

    #[error("mask file {path}: {reason}")]
    Mask { path: String, reason: String },

    #[error("capture device: {0}")]
    Capture(String),

    #[error("buffer geometry mismatch: expected {expected} bytes, got {got}")]
    Geometry { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
