//! Conversion job: one EMB input driven through decode, derive and encode.
//!
//! ```text
//! Idle -> Staging -> Decoding -> Encoding -> Succeeded
//!            |           |           |
//!            +-----------+-----------+----> Failed
//!   (any non-terminal) ---------------------> Cancelled
//! ```
//!
//! Cancellation is polled at each transition boundary; decode and encode
//! are never interrupted mid-stream. Staged output lives in a temporary file
//! next to the target and only replaces the target on success.

use crate::dst::{self, DstOptions};
use crate::emb::{self, Diagnostic};
use crate::error::{JobError, JobErrorCause, Remedy, ResourceError, Stage};
use crate::layout::EmbLayout;
use crate::metadata::{self, DesignMetadata};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;

/// Lifecycle state of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Staging,
    Decoding,
    Encoding,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Idle => "idle",
            JobState::Staging => "staging",
            JobState::Decoding => "decoding",
            JobState::Encoding => "encoding",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        })
    }
}

/// Where the EMB bytes come from.
#[derive(Debug, Clone)]
pub enum JobInput {
    Bytes(Arc<[u8]>),
    /// Read during staging.
    File(PathBuf),
}

impl From<Vec<u8>> for JobInput {
    fn from(bytes: Vec<u8>) -> Self {
        JobInput::Bytes(bytes.into())
    }
}

/// Where the DST bytes go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
    /// Only returned in the [`ConversionOutput`].
    #[default]
    Memory,
    /// Also written to this path, atomically, on success.
    File(PathBuf),
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; honored at the next transition boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives every state transition of a job.
pub trait JobObserver {
    fn on_transition(&mut self, from: JobState, to: JobState);
}

impl<F: FnMut(JobState, JobState)> JobObserver for F {
    fn on_transition(&mut self, from: JobState, to: JobState) {
        self(from, to)
    }
}

/// Result of a successful conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// The encoded DST stream.
    pub bytes: Vec<u8>,
    /// Set when the output was written to a file.
    pub path: Option<PathBuf>,
    pub metadata: DesignMetadata,
    /// Non-fatal decode diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// DST records emitted, splits included.
    pub records: usize,
}

/// Terminal result of a job.
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(ConversionOutput),
    Failed(JobError),
    /// Cancelled before entering the state after `during`.
    Cancelled { during: JobState },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled { .. } => JobState::Cancelled,
        }
    }

    /// What the caller should do; `None` on success.
    pub fn remedy(&self) -> Option<Remedy> {
        match self {
            JobOutcome::Succeeded(_) => None,
            JobOutcome::Failed(err) => Some(err.remedy()),
            JobOutcome::Cancelled { .. } => Some(Remedy::NoActionNeeded),
        }
    }

    pub fn output(&self) -> Option<&ConversionOutput> {
        match self {
            JobOutcome::Succeeded(output) => Some(output),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<ConversionOutput, JobOutcome> {
        match self {
            JobOutcome::Succeeded(output) => Ok(output),
            other => Err(other),
        }
    }
}

/// Input and output held for the duration of a run.
struct Staged {
    bytes: Arc<[u8]>,
    output: Option<(NamedTempFile, PathBuf)>,
}

/// A single EMB to DST conversion.
pub struct ConversionJob {
    input: JobInput,
    target: OutputTarget,
    layout: Arc<EmbLayout>,
    options: DstOptions,
    cancel: CancelToken,
    state: JobState,
}

impl ConversionJob {
    pub fn new(input: impl Into<JobInput>, target: OutputTarget) -> Self {
        Self {
            input: input.into(),
            target,
            layout: Arc::new(EmbLayout::default()),
            options: DstOptions::default(),
            cancel: CancelToken::new(),
            state: JobState::Idle,
        }
    }

    pub fn with_layout(mut self, layout: impl Into<Arc<EmbLayout>>) -> Self {
        self.layout = layout.into();
        self
    }

    pub fn with_options(mut self, options: DstOptions) -> Self {
        self.options = options;
        self
    }

    /// Share an existing cancellation flag.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run to a terminal state without observing transitions.
    pub fn run(self) -> JobOutcome {
        self.run_observed(&mut |_: JobState, _: JobState| {})
    }

    /// Run to a terminal state, reporting each transition.
    #[tracing::instrument(skip_all, name = "conversion_job")]
    pub fn run_observed(mut self, observer: &mut dyn JobObserver) -> JobOutcome {
        let outcome = match self.execute(observer) {
            Ok(output) => JobOutcome::Succeeded(output),
            Err(outcome) => outcome,
        };
        self.transition(outcome.state(), observer);

        match &outcome {
            JobOutcome::Succeeded(output) => tracing::info!(
                stitches = output.metadata.stitch_count,
                records = output.records,
                diagnostics = output.diagnostics.len(),
                "conversion succeeded"
            ),
            JobOutcome::Failed(err) => {
                tracing::info!(stage = %err.stage, remedy = %err.remedy(), "{err}")
            }
            JobOutcome::Cancelled { during } => {
                tracing::info!(%during, "conversion cancelled")
            }
        }
        outcome
    }

    fn transition(&mut self, to: JobState, observer: &mut dyn JobObserver) {
        let from = self.state;
        tracing::debug!(%from, %to, "job transition");
        self.state = to;
        observer.on_transition(from, to);
    }

    /// Check for cancellation, then move to `to`.
    fn advance(&mut self, to: JobState, observer: &mut dyn JobObserver) -> Result<(), JobOutcome> {
        self.checkpoint()?;
        self.transition(to, observer);
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), JobOutcome> {
        if self.cancel.is_cancelled() {
            return Err(JobOutcome::Cancelled { during: self.state });
        }
        Ok(())
    }

    fn execute(&mut self, observer: &mut dyn JobObserver) -> Result<ConversionOutput, JobOutcome> {
        self.advance(JobState::Staging, observer)?;
        let staged = self.stage().map_err(failed(Stage::Staging))?;

        self.advance(JobState::Decoding, observer)?;
        let decoded =
            emb::decode(&staged.bytes, &self.layout).map_err(failed(Stage::Decoding))?;
        let mut design = decoded.design;
        if let Some(label) = self.label() {
            design.set_label(Some(label));
        }
        drop(staged.bytes);

        self.advance(JobState::Encoding, observer)?;
        let metadata = metadata::derive(&design);
        let encoded = dst::encode(&design, &self.options).map_err(failed(Stage::Encoding))?;

        self.checkpoint()?;
        let path = match staged.output {
            Some((temp, path)) => {
                persist(temp, &path, &encoded.bytes).map_err(failed(Stage::Encoding))?;
                Some(path)
            }
            None => None,
        };

        Ok(ConversionOutput {
            bytes: encoded.bytes,
            path,
            metadata,
            diagnostics: decoded.diagnostics,
            records: encoded.records,
        })
    }

    fn stage(&self) -> Result<Staged, ResourceError> {
        let bytes = match &self.input {
            JobInput::Bytes(bytes) => Arc::clone(bytes),
            JobInput::File(path) => std::fs::read(path)
                .map_err(|source| ResourceError::Read {
                    path: path.clone(),
                    source,
                })?
                .into(),
        };

        let output = match &self.target {
            OutputTarget::Memory => None,
            OutputTarget::File(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                let temp = tempfile::Builder::new()
                    .prefix(".tambour-")
                    .suffix(".part")
                    .tempfile_in(dir)
                    .map_err(|source| ResourceError::Stage {
                        path: path.clone(),
                        source,
                    })?;
                tracing::debug!(temp = %temp.path().display(), "staged output");
                Some((temp, path.clone()))
            }
        };

        Ok(Staged { bytes, output })
    }

    /// Explicit label, else the input file stem.
    fn label(&self) -> Option<String> {
        self.options.label.clone().or_else(|| match &self.input {
            JobInput::File(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
            JobInput::Bytes(_) => None,
        })
    }
}

fn failed<E: Into<JobErrorCause>>(stage: Stage) -> impl FnOnce(E) -> JobOutcome {
    move |e| JobOutcome::Failed(JobError::new(stage, e))
}

fn persist(mut temp: NamedTempFile, path: &Path, bytes: &[u8]) -> Result<(), ResourceError> {
    let err = |source| ResourceError::Persist {
        path: path.to_path_buf(),
        source,
    };
    temp.write_all(bytes).map_err(err)?;
    temp.flush().map_err(err)?;
    temp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EncodeError, FormatError};
    use crate::fixtures::{EmbBuilder, Rec, square_emb};
    use tempfile::TempDir;

    fn entries(dir: &TempDir) -> Vec<PathBuf> {
        std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    fn expect_failure(outcome: JobOutcome) -> JobError {
        match outcome {
            JobOutcome::Failed(err) => err,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_success_in_memory() {
        let mut seen = Vec::new();
        let outcome = ConversionJob::new(square_emb(), OutputTarget::Memory)
            .run_observed(&mut |from: JobState, to: JobState| seen.push((from, to)));

        let output = outcome.output().unwrap();
        assert_eq!(output.metadata.stitch_count, 3);
        assert_eq!(output.records, 5);
        assert!(output.path.is_none());
        assert_eq!(
            seen,
            vec![
                (JobState::Idle, JobState::Staging),
                (JobState::Staging, JobState::Decoding),
                (JobState::Decoding, JobState::Encoding),
                (JobState::Encoding, JobState::Succeeded),
            ]
        );
    }

    #[test]
    fn test_success_writes_only_the_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("square.dst");

        let outcome = ConversionJob::new(square_emb(), OutputTarget::File(target.clone())).run();

        let output = outcome.output().unwrap();
        assert_eq!(output.path.as_deref(), Some(target.as_path()));
        assert_eq!(std::fs::read(&target).unwrap(), output.bytes);
        assert_eq!(entries(&dir), vec![target]);
    }

    #[test]
    fn test_cancel_during_decoding_releases_staging() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.dst");
        let job = ConversionJob::new(square_emb(), OutputTarget::File(target.clone()));
        let token = job.cancel_token();

        let mut staged_files = 0;
        let outcome = job.run_observed(&mut |_: JobState, to: JobState| {
            if to == JobState::Decoding {
                staged_files = std::fs::read_dir(dir.path()).unwrap().count();
                token.cancel();
            }
        });

        assert_eq!(staged_files, 1);
        assert!(matches!(
            outcome,
            JobOutcome::Cancelled {
                during: JobState::Decoding
            }
        ));
        assert_eq!(outcome.remedy(), Some(Remedy::NoActionNeeded));
        assert!(!target.exists());
        assert!(entries(&dir).is_empty());
    }

    #[test]
    fn test_cancel_before_start() {
        let job = ConversionJob::new(square_emb(), OutputTarget::Memory);
        job.cancel_token().cancel();

        let mut seen = Vec::new();
        let outcome = job.run_observed(&mut |from: JobState, to: JobState| seen.push((from, to)));

        assert_eq!(outcome.state(), JobState::Cancelled);
        assert_eq!(seen, vec![(JobState::Idle, JobState::Cancelled)]);
    }

    #[test]
    fn test_decode_failure_names_stage() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.dst");

        let outcome =
            ConversionJob::new(b"NOPE, not an EMB file at all, no sir".to_vec(), OutputTarget::File(target))
                .run();

        let err = expect_failure(outcome);
        assert_eq!(err.stage, Stage::Decoding);
        assert!(matches!(
            err.cause,
            JobErrorCause::Format(FormatError::BadMagic { .. })
        ));
        assert_eq!(err.remedy(), Remedy::FixInput);
        assert!(entries(&dir).is_empty());
    }

    #[test]
    fn test_encode_failure_on_empty_design() {
        let bytes = EmbBuilder::new()
            .color([1, 2, 3], "")
            .record(Rec::ColorChange)
            .record(Rec::End)
            .build();

        let outcome = ConversionJob::new(bytes, OutputTarget::Memory).run();
        let err = expect_failure(outcome);
        assert_eq!(err.stage, Stage::Encoding);
        assert!(matches!(
            err.cause,
            JobErrorCause::Encode(EncodeError::EmptyDesign)
        ));
    }

    #[test]
    fn test_missing_input_file_is_retriable() {
        let dir = TempDir::new().unwrap();
        let outcome = ConversionJob::new(
            JobInput::File(dir.path().join("missing.emb")),
            OutputTarget::Memory,
        )
        .run();

        let err = expect_failure(outcome);
        assert_eq!(err.stage, Stage::Staging);
        assert_eq!(err.remedy(), Remedy::RetryLater);
    }

    #[test]
    fn test_diagnostics_reach_the_result() {
        let bytes = EmbBuilder::new()
            .record(Rec::Stitch(4, 4))
            .record(Rec::End)
            .declared_stitches(9)
            .build();

        let outcome = ConversionJob::new(bytes, OutputTarget::Memory).run();
        let output = outcome.output().unwrap();
        assert_eq!(
            output.diagnostics,
            vec![Diagnostic::CountMismatch {
                declared: 9,
                actual: 1
            }]
        );
    }

    #[test]
    fn test_label_from_file_stem() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("rose.emb");
        std::fs::write(&input, square_emb()).unwrap();

        let outcome = ConversionJob::new(JobInput::File(input), OutputTarget::Memory).run();
        let output = outcome.output().unwrap();

        assert_eq!(output.metadata.label.as_deref(), Some("rose"));
        assert!(output.bytes.starts_with(b"LA:rose "));
    }

    #[test]
    fn test_explicit_label_wins_over_file_stem() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("rose.emb");
        std::fs::write(&input, square_emb()).unwrap();

        let outcome = ConversionJob::new(JobInput::File(input), OutputTarget::Memory)
            .with_options(DstOptions {
                label: Some("Tudor rose".into()),
            })
            .run();
        assert!(outcome.output().unwrap().bytes.starts_with(b"LA:Tudor rose "));

        let outcome = ConversionJob::new(square_emb(), OutputTarget::Memory).run();
        let output = outcome.output().unwrap();
        assert_eq!(output.metadata.label, None);
        assert!(output.bytes.starts_with(b"LA:Untitled "));
    }
}
