//! Recovery planning and log replay
//!
//! The planner trusts nothing but committed metadata that decodes:
//!
//! 1. every listed index and log token is read and decoded; a token whose blob is
//!    missing or corrupt is disqualified, an I/O error aborts recovery
//! 2. two valid tokens of the same role and version abort recovery
//! 3. logs are tried newest first; a log is paired with the newest valid index at
//!    or below its version, or with an empty index if there is none, and is
//!    rejected if the index committed by its own cycle is not valid
//! 4. every valid token newer than the chosen log belongs to a timeline that
//!    never became durable and is purged before the engine resumes
//!
//! The manager's own latest-checkpoint hint is only reported, never followed.

use std::fmt;

use serde::Serialize;

use crate::address::Address;
use crate::checkpoint::{
    CheckpointManager, CheckpointToken, IndexCommitMetadata, LogCommitMetadata, SessionState,
    TokenPair,
};
use crate::error::RecoveryError;
use crate::index::{HashIndex, KeyHash};
use crate::log::{HybridLog, RecordAction};
use crate::status::Status;

/// Which kind of checkpoint a token names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    /// Index checkpoint
    Index,
    /// Log checkpoint
    Log,
}

impl fmt::Display for TokenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenRole::Index => "index",
            TokenRole::Log => "log",
        })
    }
}

/// What the planner decided about one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "kebab-case")]
pub enum Verdict {
    /// Part of the chosen pair
    Selected,
    /// Valid but older than the chosen pair
    Superseded,
    /// Valid but newer than the chosen pair; purged
    Orphaned,
    /// Unusable for the given reason
    Disqualified(String),
}

/// One candidate token and its fate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateReport {
    /// Index or log
    pub role: TokenRole,
    /// Token
    pub token: CheckpointToken,
    /// Version, if the metadata decoded
    pub version: Option<u64>,
    /// Outcome
    pub verdict: Verdict,
}

/// Everything recovery looked at and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Every candidate, logs and indexes, newest first within each role
    pub candidates: Vec<CandidateReport>,
    /// The manager's latest-checkpoint hint
    pub hint: Option<TokenPair>,
    /// Chosen pair
    pub chosen: Option<TokenPair>,
    /// Captured version of the chosen log checkpoint
    pub version: Option<u64>,
    /// Version the engine resumes at
    pub resume_version: Option<u64>,
    /// Records whose index entries were re-applied
    pub replayed_records: u64,
    /// Records tagged with a version newer than the checkpoint
    pub invalidated_records: u64,
    /// Tokens removed because they were newer than the chosen pair
    pub purged: Vec<CheckpointToken>,
    /// Session recovery points of the chosen log checkpoint
    pub session_states: Vec<SessionState>,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chosen {
            Some(pair) => writeln!(
                f,
                "recovered {pair} at version {}",
                self.version.unwrap_or_default()
            )?,
            None => writeln!(f, "no checkpoint recovered")?,
        }
        if self.candidates.is_empty() {
            writeln!(f, "  no committed checkpoints")?;
        }
        for c in &self.candidates {
            let version = c
                .version
                .map_or_else(|| "?".to_string(), |v| format!("v{v}"));
            match &c.verdict {
                Verdict::Selected => writeln!(f, "  {} {} {version}: selected", c.role, c.token)?,
                Verdict::Superseded => {
                    writeln!(f, "  {} {} {version}: superseded", c.role, c.token)?
                }
                Verdict::Orphaned => writeln!(f, "  {} {} {version}: orphaned", c.role, c.token)?,
                Verdict::Disqualified(reason) => writeln!(
                    f,
                    "  {} {} {version}: disqualified: {reason}",
                    c.role, c.token
                )?,
            }
        }
        Ok(())
    }
}

/// The pair recovery will load and how to resume from it
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// Chosen pair
    pub pair: TokenPair,
    /// Index metadata, `None` to start from an empty index
    pub index: Option<IndexCommitMetadata>,
    /// Log metadata
    pub log: LogCommitMetadata,
    /// Index entries are rebuilt for records at or after this address
    pub replay_from: Address,
    /// Strictly greater than every committed version seen
    pub resume_version: u64,
    /// Valid tokens newer than the chosen pair
    pub orphans: Vec<(TokenRole, CheckpointToken)>,
    /// Candidate report
    pub report: RecoveryReport,
}

/// Chooses the pair to recover from
pub struct RecoveryPlanner<'a> {
    manager: &'a dyn CheckpointManager,
}

impl<'a> RecoveryPlanner<'a> {
    /// Planner reading through `manager`
    pub fn new(manager: &'a dyn CheckpointManager) -> Self {
        Self { manager }
    }

    fn load<M>(
        &self,
        role: TokenRole,
        report: &mut RecoveryReport,
        decode: impl Fn(CheckpointToken, &[u8]) -> Result<(M, u64), String>,
    ) -> Result<Vec<(M, u64, CheckpointToken)>, RecoveryError> {
        let tokens = match role {
            TokenRole::Index => self.manager.index_checkpoint_tokens(),
            TokenRole::Log => self.manager.log_checkpoint_tokens(),
        }
        .map_err(RecoveryError::List)?;

        let mut valid = Vec::with_capacity(tokens.len());
        for token in tokens {
            let blob = match role {
                TokenRole::Index => self.manager.index_commit_metadata(token),
                TokenRole::Log => self.manager.log_commit_metadata(token),
            }
            .map_err(|source| RecoveryError::Io { token, source })?;

            let decoded = match blob {
                Some(bytes) => decode(token, &bytes),
                None => Err("metadata missing".to_string()),
            };
            match decoded {
                Ok((meta, version)) => valid.push((meta, version, token)),
                Err(reason) => {
                    tracing::warn!(
                        role = %role,
                        token = %token,
                        reason = %reason,
                        "checkpoint candidate disqualified"
                    );
                    report.candidates.push(CandidateReport {
                        role,
                        token,
                        version: None,
                        verdict: Verdict::Disqualified(reason),
                    });
                }
            }
        }
        valid.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(valid)
    }

    /// Choose the newest consistent pair.
    pub fn plan(&self) -> Result<RecoveryPlan, RecoveryError> {
        let mut report = RecoveryReport {
            hint: self.manager.latest_checkpoint().ok().flatten(),
            ..RecoveryReport::default()
        };

        let indexes = self.load(TokenRole::Index, &mut report, |token, bytes| {
            let meta = IndexCommitMetadata::decode(bytes).map_err(|e| e.to_string())?;
            if meta.token != token {
                return Err(format!("metadata belongs to token {}", meta.token));
            }
            let version = meta.version;
            Ok((meta, version))
        })?;
        let logs = self.load(TokenRole::Log, &mut report, |token, bytes| {
            let meta = LogCommitMetadata::decode(bytes).map_err(|e| e.to_string())?;
            if meta.token != token {
                return Err(format!("metadata belongs to token {}", meta.token));
            }
            if meta.final_address < meta.begin_address {
                return Err(format!(
                    "final address {} precedes begin address {}",
                    meta.final_address, meta.begin_address
                ));
            }
            let version = meta.version;
            Ok((meta, version))
        })?;

        for pair in indexes.windows(2) {
            if pair[0].1 == pair[1].1 {
                return Err(RecoveryError::AmbiguousIndexVersion {
                    version: pair[0].1,
                    first: pair[0].2,
                    second: pair[1].2,
                });
            }
        }
        for pair in logs.windows(2) {
            if pair[0].1 == pair[1].1 {
                return Err(RecoveryError::AmbiguousLogVersion {
                    version: pair[0].1,
                    first: pair[0].2,
                    second: pair[1].2,
                });
            }
        }

        let max_seen = indexes
            .iter()
            .map(|i| i.1)
            .chain(logs.iter().map(|l| l.1))
            .max()
            .unwrap_or(0);

        let mut log_reports = Vec::with_capacity(logs.len());
        let mut chosen: Option<(LogCommitMetadata, Option<IndexCommitMetadata>)> = None;
        for (log, version, token) in logs {
            if let Some((ref chosen_log, _)) = chosen {
                let verdict = if version > chosen_log.version {
                    Verdict::Orphaned
                } else {
                    Verdict::Superseded
                };
                log_reports.push(CandidateReport {
                    role: TokenRole::Log,
                    token,
                    version: Some(version),
                    verdict,
                });
                continue;
            }

            if let Some(own) = log.index_token {
                if !indexes.iter().any(|(_, _, t)| *t == own) {
                    let reason = format!("index checkpoint {own} of the same cycle is not valid");
                    tracing::warn!(
                        role = %TokenRole::Log,
                        token = %token,
                        version,
                        reason = %reason,
                        "checkpoint candidate disqualified"
                    );
                    log_reports.push(CandidateReport {
                        role: TokenRole::Log,
                        token,
                        version: Some(version),
                        verdict: Verdict::Disqualified(reason),
                    });
                    continue;
                }
            }

            let index = indexes
                .iter()
                .find(|(_, v, _)| *v <= version)
                .map(|(meta, _, _)| meta.clone());
            log_reports.push(CandidateReport {
                role: TokenRole::Log,
                token,
                version: Some(version),
                verdict: Verdict::Selected,
            });
            chosen = Some((log, index));
        }

        // Logs rejected before the chosen one was found are newer than it.
        let Some((log, index)) = chosen else {
            report.candidates.extend(log_reports);
            report
                .candidates
                .extend(indexes.iter().map(|(_, version, token)| CandidateReport {
                    role: TokenRole::Index,
                    token: *token,
                    version: Some(*version),
                    verdict: Verdict::Superseded,
                }));
            return Err(RecoveryError::NoValidCheckpoint {
                report: Box::new(report),
            });
        };

        let mut orphans = Vec::new();
        for c in &log_reports {
            if c.version.is_some_and(|v| v > log.version) {
                orphans.push((TokenRole::Log, c.token));
            }
        }
        report.candidates.extend(log_reports);

        let index_token = index.as_ref().map(|meta| meta.token);
        for (_, version, token) in &indexes {
            let verdict = if Some(*token) == index_token {
                Verdict::Selected
            } else if *version > log.version {
                orphans.push((TokenRole::Index, *token));
                Verdict::Orphaned
            } else {
                Verdict::Superseded
            };
            report.candidates.push(CandidateReport {
                role: TokenRole::Index,
                token: *token,
                version: Some(*version),
                verdict,
            });
        }

        let pair = TokenPair::new(index_token, log.token);
        let resume_version = log.next_version.max(max_seen + 1).max(log.version + 1);
        let replay_from = index
            .as_ref()
            .map_or(log.begin_address, |meta| meta.checkpoint_start_address)
            .max(log.begin_address);

        if report.hint.is_some_and(|hint| hint != pair) {
            tracing::debug!(hint = ?report.hint, chosen = %pair, "manager hint differs from the chosen pair");
        }
        tracing::info!(
            pair = %pair,
            version = log.version,
            resume_version,
            kind = log.kind.as_str(),
            "recovery pair selected"
        );

        report.chosen = Some(pair);
        report.version = Some(log.version);
        report.resume_version = Some(resume_version);
        report.session_states = log.session_states.clone();

        Ok(RecoveryPlan {
            pair,
            index,
            log,
            replay_from,
            resume_version,
            orphans,
            report,
        })
    }

    /// Delete every orphan of `plan`, metadata first.
    pub fn purge_orphans(&self, plan: &mut RecoveryPlan) -> Result<(), RecoveryError> {
        for (role, token) in std::mem::take(&mut plan.orphans) {
            let result = match role {
                TokenRole::Index => self
                    .manager
                    .remove_index_commit_metadata(token)
                    .and_then(|()| self.manager.purge_index_artifacts(token)),
                TokenRole::Log => self
                    .manager
                    .remove_log_commit_metadata(token)
                    .and_then(|()| self.manager.purge_log_artifacts(token)),
            };
            result.map_err(|source| RecoveryError::Purge { token, source })?;
            tracing::info!(role = %role, token = %token, "orphaned checkpoint purged");
            plan.report.purged.push(token);
        }
        Ok(())
    }
}

/// What [`replay_log`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records whose index entry was re-applied
    pub replayed: u64,
    /// Records marked invalid for carrying a newer version
    pub invalidated: u64,
    /// Index entries dropped for pointing past the covered range
    pub cleared_entries: u64,
    /// Lowest address of an invalidated record
    pub first_invalidated: Option<Address>,
}

/// Bring a freshly restored index in line with log checkpoint `version`.
///
/// Every record in the restored log tagged with a version newer than `version` is
/// marked invalid; every other record at or after `from` re-applies its index
/// entry, in log order. Fails if any covered record cannot be indexed, since the
/// recovered store would otherwise miss committed keys.
pub fn replay_log(
    index: &HashIndex,
    log: &HybridLog,
    from: Address,
    to: Address,
    version: u64,
) -> Result<ReplayStats, RecoveryError> {
    let mut stats = ReplayStats {
        cleared_entries: index.clear_entries_from(to),
        ..ReplayStats::default()
    };
    let mut failed = 0u64;
    let mut first_failure: Option<(Address, Status)> = None;
    log.for_each_record(log.begin_address(), to, |address, header, key| {
        if header.version > version {
            stats.invalidated += 1;
            stats.first_invalidated.get_or_insert(address);
            return RecordAction::Invalidate;
        }
        if address >= from && !header.info.is_invalid() {
            match index.set_entry(KeyHash::of(key), address) {
                Ok(()) => stats.replayed += 1,
                Err(status) => {
                    failed += 1;
                    first_failure.get_or_insert((address, status));
                }
            }
        }
        RecordAction::Keep
    });
    if let Some((first, status)) = first_failure {
        tracing::warn!(
            failed,
            first = %first,
            status = %status,
            overflow_capacity = index.overflow_capacity(),
            "index entries could not be re-applied during replay"
        );
        return Err(RecoveryError::Replay {
            failed,
            first,
            status,
        });
    }
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(
            from = %from,
            to = %to,
            replayed = stats.replayed,
            invalidated = stats.invalidated,
            "log replayed"
        );
    }
    Ok(stats)
}
