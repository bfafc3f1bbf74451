//! Pure merge functions over Loro update payloads, plus the inline executor.
//!
//! Every function allocates its own scratch `LoroDoc` and drops it before
//! returning, so nothing survives between calls.

use super::{
    DocMergeResult, DocUpdates, ExecutionPath, MergeError, MergeExecutor, MergeRequest,
    MergeResponse, Result, UpdateStats, Validation,
};
use async_trait::async_trait;
use loro::{ExportMode, LoroDoc};

/// Merge several updates into one payload.
///
/// Empty inputs are skipped. No inputs yields the empty marker, a single
/// input is returned as is, anything more is imported into one scratch
/// document as a single batch and re-exported.
///
/// The inputs must be self-contained together. Incremental updates whose
/// base changes are no longer among them (for example because the base was
/// already synced and removed from the queue) fail with
/// [`MergeError::MissingDependencies`]; callers keep such updates unmerged.
pub fn merge_updates(mut updates: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    updates.retain(|u| !u.is_empty());
    match updates.len() {
        0 => Ok(Vec::new()),
        1 => Ok(updates.swap_remove(0)),
        _ => {
            let doc = LoroDoc::new();
            let status = doc
                .import_batch(&updates)
                .map_err(|e| MergeError::Decode(e.to_string()))?;
            if let Some(pending) = status.pending {
                return Err(MergeError::MissingDependencies(format!("{pending:?}")));
            }
            let merged = doc
                .export(ExportMode::all_updates())
                .map_err(|e| MergeError::Encode(e.to_string()))?;
            drop(doc);
            Ok(merged)
        }
    }
}

/// Merge several documents independently; one failure does not affect the rest.
pub fn batch_merge(docs: Vec<DocUpdates>) -> Vec<DocMergeResult> {
    docs.into_iter()
        .map(|doc| match merge_updates(doc.updates) {
            Ok(merged) => DocMergeResult {
                doc_id: doc.doc_id,
                merged: Some(merged),
                error: None,
            },
            Err(e) => DocMergeResult {
                doc_id: doc.doc_id,
                merged: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

pub fn validate(update: &[u8]) -> Validation {
    let size = update.len();
    if update.is_empty() {
        return Validation {
            valid: true,
            size,
            error: None,
        };
    }

    let doc = LoroDoc::new();
    let result = doc.import(update);
    drop(doc);
    match result {
        Ok(_) => Validation {
            valid: true,
            size,
            error: None,
        },
        Err(e) => Validation {
            valid: false,
            size,
            error: Some(e.to_string()),
        },
    }
}

pub fn update_stats(update: &[u8]) -> Result<UpdateStats> {
    if update.is_empty() {
        return Ok(UpdateStats::default());
    }
    let doc = LoroDoc::new();
    doc.import(update)
        .map_err(|e| MergeError::Decode(e.to_string()))?;
    let stats = UpdateStats {
        size: update.len(),
        changes: doc.len_changes(),
        ops: doc.len_ops(),
    };
    drop(doc);
    Ok(stats)
}

/// Run a request in the current thread.
pub(crate) fn execute(request: MergeRequest) -> Result<MergeResponse> {
    Ok(match request {
        MergeRequest::Merge(updates) => MergeResponse::Merged(merge_updates(updates)?),
        MergeRequest::Batch(docs) => MergeResponse::Batch(batch_merge(docs)),
        MergeRequest::Validate(update) => MergeResponse::Validation(validate(&update)),
        MergeRequest::Stats(update) => MergeResponse::Stats(update_stats(&update)?),
    })
}

/// Executes merges synchronously in the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

#[async_trait]
impl MergeExecutor for InlineExecutor {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Inline
    }

    async fn execute(&self, request: MergeRequest) -> Result<MergeResponse> {
        execute(request)
    }
}
