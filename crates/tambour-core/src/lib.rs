//! Tambour: EMB embroidery decoding and Tajima DST encoding.
//!
//! A design is decoded from EMB into a [`Design`], summarized by
//! [`derive`], and encoded as DST. [`ConversionJob`] drives one conversion
//! through its state machine; [`JobRunner`] admits requests from an outer
//! layer and runs them one at a time.

mod batch;
pub mod dst;
pub mod emb;
mod error;
mod fingerprint;
mod job;
mod layout;
mod metadata;
mod model;
mod runner;

#[cfg(test)]
mod fixtures;

pub use batch::{BatchItem, convert_batch};
pub use dst::DstOptions;
pub use emb::{Decoded, Diagnostic};
pub use error::{
    Axis, EncodeError, FormatError, JobError, JobErrorCause, ModelError, Region, Remedy,
    ResourceError, RunnerError, Stage,
};
pub use fingerprint::Fingerprint;
pub use job::{
    CancelToken, ConversionJob, ConversionOutput, JobInput, JobObserver, JobOutcome, JobState,
    OutputTarget,
};
pub use layout::{
    ByteOrder, ColorRecordLayout, CommandCodes, EmbLayout, ExtensionLayout, HeaderFields,
    StitchRecordLayout,
};
pub use metadata::{Bounds, DesignMetadata, derive};
pub use model::{ColorEntry, Design, Rgb, Stitch};
pub use runner::{
    AdmissionPolicy, ConversionRequest, JobHandle, JobId, JobRunner, JobStatus, RunnerConfig,
    Transition, TransitionHook,
};
