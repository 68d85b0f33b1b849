//! Garbage collection of superseded checkpoints
//!
//! A token is deleted only if its metadata decodes and its version is strictly
//! older than the pair being kept. Metadata goes first, then artifacts, so a crash
//! in between leaves unreferenced bytes rather than metadata pointing at nothing.

use serde::Serialize;

use crate::checkpoint::{
    CheckpointManager, CheckpointToken, IndexCommitMetadata, LogCommitMetadata, TokenPair,
};

/// What a garbage collection pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Index tokens whose metadata and artifacts were removed
    pub removed_index: Vec<CheckpointToken>,
    /// Log tokens whose metadata and artifacts were removed
    pub removed_log: Vec<CheckpointToken>,
    /// Tokens left alone because their metadata could not be read or decoded
    pub skipped: Vec<CheckpointToken>,
    /// Deletions that failed, with the error
    pub failures: Vec<String>,
}

impl GcReport {
    /// Number of tokens removed
    pub fn removed(&self) -> usize {
        self.removed_index.len() + self.removed_log.len()
    }
}

/// Delete every checkpoint strictly older than `keep`, except `pinned` tokens.
///
/// Best effort: failures are logged and reported, never returned as errors.
pub fn collect_garbage(
    manager: &dyn CheckpointManager,
    keep: TokenPair,
    pinned: &[CheckpointToken],
) -> GcReport {
    let mut report = GcReport::default();

    let keep_log_version = match manager.log_commit_metadata(keep.log_token) {
        Ok(Some(bytes)) => match LogCommitMetadata::decode(&bytes) {
            Ok(meta) => meta.version,
            Err(e) => {
                report.failures.push(format!("kept log {}: {e}", keep.log_token));
                return report;
            }
        },
        Ok(None) => {
            report
                .failures
                .push(format!("kept log {} has no metadata", keep.log_token));
            return report;
        }
        Err(e) => {
            report.failures.push(format!("kept log {}: {e}", keep.log_token));
            return report;
        }
    };
    let keep_index_version = match keep.index_token {
        Some(token) => match manager.index_commit_metadata(token) {
            Ok(Some(bytes)) => match IndexCommitMetadata::decode(&bytes) {
                Ok(meta) => meta.version,
                Err(e) => {
                    report.failures.push(format!("kept index {token}: {e}"));
                    return report;
                }
            },
            Ok(None) => {
                report
                    .failures
                    .push(format!("kept index {token} has no metadata"));
                return report;
            }
            Err(e) => {
                report.failures.push(format!("kept index {token}: {e}"));
                return report;
            }
        },
        // Recovery pairs a log without an index token with the newest valid index
        // at or below its version, so that index is the one to keep.
        None => match paired_index_version(manager, keep_log_version) {
            Ok(version) => version.unwrap_or(keep_log_version),
            Err(e) => {
                report.failures.push(format!("listing index tokens: {e}"));
                return report;
            }
        },
    };

    let protected = |token: CheckpointToken| keep.contains(token) || pinned.contains(&token);

    match manager.log_checkpoint_tokens() {
        Ok(tokens) => {
            for token in tokens.into_iter().filter(|t| !protected(*t)) {
                let version = manager
                    .log_commit_metadata(token)
                    .ok()
                    .flatten()
                    .and_then(|bytes| LogCommitMetadata::decode(&bytes).ok())
                    .map(|meta| meta.version);
                match version {
                    Some(v) if v < keep_log_version => {
                        let result = manager
                            .remove_log_commit_metadata(token)
                            .and_then(|()| manager.purge_log_artifacts(token));
                        record(&mut report, token, v, "log", result, |r| &mut r.removed_log);
                    }
                    Some(_) => {}
                    None => report.skipped.push(token),
                }
            }
        }
        Err(e) => report.failures.push(format!("listing log tokens: {e}")),
    }

    match manager.index_checkpoint_tokens() {
        Ok(tokens) => {
            for token in tokens.into_iter().filter(|t| !protected(*t)) {
                let version = manager
                    .index_commit_metadata(token)
                    .ok()
                    .flatten()
                    .and_then(|bytes| IndexCommitMetadata::decode(&bytes).ok())
                    .map(|meta| meta.version);
                match version {
                    Some(v) if v < keep_index_version => {
                        let result = manager
                            .remove_index_commit_metadata(token)
                            .and_then(|()| manager.purge_index_artifacts(token));
                        record(&mut report, token, v, "index", result, |r| {
                            &mut r.removed_index
                        });
                    }
                    Some(_) => {}
                    None => report.skipped.push(token),
                }
            }
        }
        Err(e) => report.failures.push(format!("listing index tokens: {e}")),
    }

    report
}

/// Version of the newest decodable index checkpoint at or below `log_version`
fn paired_index_version(
    manager: &dyn CheckpointManager,
    log_version: u64,
) -> std::io::Result<Option<u64>> {
    Ok(manager
        .index_checkpoint_tokens()?
        .into_iter()
        .filter_map(|token| {
            manager
                .index_commit_metadata(token)
                .ok()
                .flatten()
                .and_then(|bytes| IndexCommitMetadata::decode(&bytes).ok())
        })
        .map(|meta| meta.version)
        .filter(|version| *version <= log_version)
        .max())
}

fn record(
    report: &mut GcReport,
    token: CheckpointToken,
    version: u64,
    role: &str,
    result: std::io::Result<()>,
    removed: impl FnOnce(&mut GcReport) -> &mut Vec<CheckpointToken>,
) {
    match result {
        Ok(()) => {
            tracing::info!(token = %token, version, role, "checkpoint garbage collected");
            removed(report).push(token);
        }
        Err(e) => {
            tracing::warn!(token = %token, version, role, error = %e, "checkpoint garbage collection failed");
            report.failures.push(format!("{role} {token}: {e}"));
        }
    }
}
