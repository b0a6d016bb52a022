// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operation-level error type.
//!
//! Per-packet failures never reach this type — they're folded into per-stream
//! [`crate::stats::DropReason`] counters and the packet is freed (see §7 of
//! the design notes: "Per-packet failures are counted and the packet is
//! freed; no upward propagation"). `Error` is reserved for control-plane API
//! calls (`channel_create`, `process_app`, bind operations, ...) that fail
//! without side effect.

use std::fmt;

/// An error from a control-plane-facing API call.
///
/// Boxed so that `Result<T, Error>` stays small on the stack regardless of
/// which variant is in play — mirrors the pattern used throughout the
/// teacher crate's RTSP/RTP error type.
#[derive(Debug)]
pub struct Error(Box<ErrorInt>);

impl Error {
    pub fn kind(&self) -> &ErrorInt {
        &self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.0)
    }
}

impl From<ErrorInt> for Error {
    fn from(e: ErrorInt) -> Self {
        Error(Box::new(e))
    }
}

/// Taxonomy from design notes §7.
#[derive(Debug, thiserror::Error)]
pub enum ErrorInt {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("module not initialized")]
    NotInitialized,

    #[error("module already initialized")]
    AlreadyInitialized,

    #[error("no resource available: {0}")]
    NoResource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid APP message: {0}")]
    InvalidApp(String),

    #[error("no resource to host RTP header over APP buffer")]
    NoResourceForRtpHeader,

    #[error("stream error: {0}")]
    StreamError(StreamErrorReason),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Sub-reasons for [`ErrorInt::StreamError`], reported at bind time (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorReason {
    NoNackCapability,
    EncapMismatch,
    OutputStreamAlreadyConnected,
    InvalidMethod,
}

impl fmt::Display for StreamErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamErrorReason::NoNackCapability => "peer lacks NACK capability",
            StreamErrorReason::EncapMismatch => "encapsulation mismatch",
            StreamErrorReason::OutputStreamAlreadyConnected => "output stream already connected",
            StreamErrorReason::InvalidMethod => "invalid method",
        };
        write!(f, "{}", s)
    }
}

/// Constructs an [`Error`] from an [`ErrorInt`] variant, logging at `error!`
/// for `Internal` variants as they're built (teacher-style `wrap!`/`bail!`
/// call-site macros, see `src/client/rtp.rs`).
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::Error::from($crate::error::ErrorInt::$variant(format!($($arg)*)))
    };
}

macro_rules! bail {
    ($variant:ident, $($arg:tt)*) => {
        return Err(err!($variant, $($arg)*))
    };
}

pub(crate) use bail;
pub(crate) use err;

pub type Result<T> = std::result::Result<T, Error>;
