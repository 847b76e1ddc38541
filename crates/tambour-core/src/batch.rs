//! Batch conversion of independent inputs.
//!
//! Each request runs as its own [`ConversionJob`], outside any runner. With
//! the `parallel` feature the jobs run on the rayon pool.

use crate::dst::DstOptions;
use crate::job::{ConversionJob, ConversionOutput, JobInput, JobOutcome, OutputTarget};
use crate::layout::EmbLayout;
use std::sync::Arc;

/// One input of a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub input: JobInput,
    pub target: OutputTarget,
    pub label: Option<String>,
}

impl BatchItem {
    pub fn new(input: impl Into<JobInput>, target: OutputTarget) -> Self {
        Self {
            input: input.into(),
            target,
            label: None,
        }
    }
}

fn run_item(item: BatchItem, layout: &Arc<EmbLayout>) -> Result<ConversionOutput, JobOutcome> {
    ConversionJob::new(item.input, item.target)
        .with_layout(Arc::clone(layout))
        .with_options(DstOptions { label: item.label })
        .run()
        .into_result()
}

/// Convert every item, returning results in input order.
#[cfg(feature = "parallel")]
pub fn convert_batch(
    items: Vec<BatchItem>,
    layout: &EmbLayout,
) -> Vec<Result<ConversionOutput, JobOutcome>> {
    use rayon::prelude::*;

    let layout = Arc::new(layout.clone());
    items
        .into_par_iter()
        .map(|item| run_item(item, &layout))
        .collect()
}

/// Convert every item, returning results in input order.
#[cfg(not(feature = "parallel"))]
pub fn convert_batch(
    items: Vec<BatchItem>,
    layout: &EmbLayout,
) -> Vec<Result<ConversionOutput, JobOutcome>> {
    let layout = Arc::new(layout.clone());
    items
        .into_iter()
        .map(|item| run_item(item, &layout))
        .collect()
}
