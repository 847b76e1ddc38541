//! Error taxonomy for decoding, encoding and running conversion jobs.
//!
//! Every fallible boundary returns one of these typed errors. The conversion
//! job is the only place that decides an error is fatal; [`Remedy`] tells the
//! outer layer whether to ask for a different input or simply try again.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    /// The input (or the design it describes) must change.
    FixInput,
    /// The same request may succeed later.
    RetryLater,
    /// Caller-initiated; nothing went wrong.
    NoActionNeeded,
}

impl fmt::Display for Remedy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Remedy::FixInput => "fix the input file",
            Remedy::RetryLater => "try again",
            Remedy::NoActionNeeded => "no action needed",
        })
    }
}

/// Violations of the stitch sequence invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("stitch appended after the End marker")]
    StitchAfterEnd,

    #[error("End marker at index {index} is not the last stitch")]
    MisplacedEnd { index: usize },

    #[error("stitch sequence has no End marker")]
    MissingEnd,
}

/// A region of an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Header,
    ColorTable,
    StitchData,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Header => "header",
            Region::ColorTable => "color table",
            Region::StitchData => "stitch data",
        })
    }
}

/// Malformed or unrecognized input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("input truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unrecognized magic signature {found:02x?}")]
    BadMagic { found: Vec<u8> },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("{region} at offset {offset} (+{len} bytes) lies outside the {size}-byte input")]
    RegionOutOfBounds {
        region: Region,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl FormatError {
    pub fn remedy(&self) -> Remedy {
        Remedy::FixInput
    }
}

/// Coordinate axis, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "x",
            Axis::Y => "y",
        })
    }
}

/// The decoded design cannot be represented in the output format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("design has no stitches to encode")]
    EmptyDesign,

    #[error("{axis} coordinate {value} at stitch {stitch} exceeds the representable range ±{limit}")]
    CoordinateOverflow {
        stitch: usize,
        axis: Axis,
        value: i64,
        limit: i64,
    },

    #[error("design needs {0} records, more than the header can declare")]
    TooManyRecords(usize),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl EncodeError {
    pub fn remedy(&self) -> Remedy {
        Remedy::FixInput
    }
}

/// Staging or file I/O failure.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to read input '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stage output next to '{}': {source}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write output '{}': {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResourceError {
    pub fn remedy(&self) -> Remedy {
        Remedy::RetryLater
    }
}

/// Job stage at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Decoding,
    Encoding,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Staging => "staging",
            Stage::Decoding => "decoding",
            Stage::Encoding => "encoding",
        })
    }
}

/// Underlying cause of a failed job.
#[derive(Debug, Error)]
pub enum JobErrorCause {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// A conversion job failure with the stage it occurred in.
#[derive(Debug, Error)]
#[error("conversion failed while {stage}: {cause}")]
pub struct JobError {
    pub stage: Stage,
    #[source]
    pub cause: JobErrorCause,
}

impl JobError {
    pub fn new(stage: Stage, cause: impl Into<JobErrorCause>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    pub fn remedy(&self) -> Remedy {
        match &self.cause {
            JobErrorCause::Format(e) => e.remedy(),
            JobErrorCause::Encode(e) => e.remedy(),
            JobErrorCause::Resource(e) => e.remedy(),
        }
    }
}

/// Admission failures from the job runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("a conversion is already in progress")]
    Busy,

    #[error("job runner has shut down")]
    ShutDown,
}

impl RunnerError {
    pub fn remedy(&self) -> Remedy {
        Remedy::RetryLater
    }
}
