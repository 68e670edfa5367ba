//! Index reconstruction.
//!
//! A recon job replays the ledger into a fresh (full) or restored (regular)
//! substore index. Progress is checkpointed once per batch: the index saves
//! land first, then one ledger write records every delivered volume. An
//! interrupted job resumes with `active set - batch records` and ends with
//! the same index an uninterrupted run would have produced.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::access::require_write;
use crate::commands::util::{kill_requested, start_job};
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::events::EngineEvent;
use crate::index::{IndexEntry, INDEX_FILE};
use crate::jobs::JobHandle;
use crate::ledger::model::{
    FailedChunkRecord, JobKind, JobStatus, ReconBatchRecord, ReconJob, ReconPhase, Volume,
    VolumeFlag,
};
use crate::ledger::Tables;
use crate::reader::{ReaderFault, VolumeScan};
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// Why a reconstruction stopped in `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// The scheduler reported an operator kill.
    OperatorKill,
    /// The volume helper reported itself killed.
    HelperKilled,
    /// The volume helper delivered nothing within the detection window.
    HelperUnresponsive,
}

#[derive(Debug, Clone)]
pub struct ReconReport {
    pub job: JobId,
    pub store: StoreId,
    pub full: bool,
    pub phase: ReconPhase,
    pub active_volumes: usize,
    pub recovered: usize,
    pub resumes: u32,
    pub paused: Option<PauseReason>,
}

enum Step {
    Done,
    Paused(PauseReason),
}

/// Reconstruct the indexes of every substore of `store`.
///
/// Returns a report in phase `Completed`, or `Pending` if the job was
/// interrupted more often than it may resume on its own.
pub fn run_recon(engine: &Engine, store: StoreId, full: bool) -> Result<ReconReport> {
    let (substores, already_pending) = engine.ledger().read(|t| -> Result<_> {
        let row = t.require_store(store)?;
        if let Some(open) = t.open_recon_job(store) {
            return Err(DdbError::InvalidState(format!(
                "{store} already has reconstruction {} in phase {}",
                open.id, open.phase
            )));
        }
        let pending: BTreeSet<SubstoreId> = t
            .substores_of(store)
            .filter(|s| s.recovery_pending)
            .map(|s| s.id)
            .collect();
        Ok((row.substores.clone(), pending))
    })?;

    let handle = start_job(engine, JobKind::Recon, Some(store))?;
    let now = engine.now();
    engine.ledger().write(|t| {
        t.insert_recon_job(ReconJob {
            id: handle.id,
            store,
            full,
            phase: ReconPhase::NotStarted,
            active_set: BTreeSet::new(),
            started_at: now,
            finished_at: None,
            resumes: 0,
        });
        Ok(())
    })?;
    info!(job = %handle.id, %store, full, "reconstruction started");

    for &substore in &substores {
        if let Err(e) = mark_for_recovery(engine, handle.id, substore) {
            // Nothing was rebuilt yet; put the recovery flags back as they were.
            let restored = engine.ledger().write(|t| {
                for s in &substores {
                    t.substore_mut(*s)?.recovery_pending = already_pending.contains(s);
                }
                Ok(())
            });
            if let Err(restore_err) = restored {
                warn!(job = %handle.id, "failed to restore recovery flags: {restore_err}");
            }
            return Err(fail(engine, handle, e));
        }
    }
    if let Err(e) = start(engine, handle.id) {
        return Err(fail(engine, handle, e));
    }
    drive(engine, handle)
}

/// Flag `substore` as needing recovery. Refused while backup sessions are
/// writing to it; the refusal is final for this attempt.
pub fn mark_for_recovery(engine: &Engine, job: JobId, substore: SubstoreId) -> Result<()> {
    if let Err(e) = engine.quiesce().begin_recovery(substore) {
        warn!(%job, %substore, "recovery precondition unmet: {e}");
        return Err(e);
    }

    let now = engine.now();
    let moved = engine.ledger().write(|t| {
        let recon = t.require_recon_job(job)?;
        let (store, phase) = (recon.store, recon.phase);
        let owner = t.require_substore(substore)?.store;
        if owner != store {
            return Err(DdbError::InvalidState(format!(
                "{substore} is not part of {store}"
            )));
        }
        t.substore_mut(substore)?.recovery_pending = true;
        match phase {
            ReconPhase::NotStarted => {
                set_phase(t, job, ReconPhase::MarkedForRecovery, now).map(Some)
            }
            ReconPhase::MarkedForRecovery => Ok(None),
            other => Err(DdbError::InvalidTransition {
                job,
                from: other.name(),
                to: ReconPhase::MarkedForRecovery.name(),
            }),
        }
    });
    let moved = match moved {
        Ok(moved) => moved,
        Err(e) => {
            engine.quiesce().end_recovery(substore);
            return Err(e);
        }
    };
    if let Some((store, from)) = moved {
        announce(engine, recon_handle(job), store, from, ReconPhase::MarkedForRecovery);
    }
    debug!(%job, %substore, "substore marked for recovery");
    Ok(())
}

/// Prepare the substore indexes and fix the active volume set, entering `AddRecords`.
pub fn start(engine: &Engine, job: JobId) -> Result<()> {
    let (recon, substores) = engine.ledger().read(|t| -> Result<_> {
        let recon = t.require_recon_job(job)?.clone();
        let substores: Vec<_> = t.substores_of(recon.store).cloned().collect();
        Ok((recon, substores))
    })?;
    if let Some(s) = substores.iter().find(|s| !s.recovery_pending) {
        return Err(DdbError::InvalidState(format!(
            "{} was not marked for recovery",
            s.id
        )));
    }

    let mut cutoffs = HashMap::new();
    for substore in &substores {
        let dir = engine.index_dir(recon.store, substore.id);
        require_write(engine.access(), dir.path())?;
        let cutoff = if recon.full {
            dir.reset()?;
            None
        } else {
            let copy = engine.backup_copy_dir(substore.last_snap_job, substore.id);
            if !substore.last_snap_job.is_none() && copy.join(INDEX_FILE).exists() {
                dir.restore_from(&copy)?;
                substore.last_snap_at
            } else {
                if !substore.last_snap_job.is_none() {
                    warn!(
                        %job,
                        substore = %substore.id,
                        snapshot = %substore.last_snap_job,
                        "DDB backup copy missing; rebuilding substore from empty"
                    );
                }
                dir.reset()?;
                None
            }
        };
        cutoffs.insert(substore.id, cutoff);
    }

    let now = engine.now();
    let (store, from, active) = engine.ledger().write(|t| {
        let active = active_volume_set(t, recon.store, &cutoffs);
        let count = active.len();
        t.recon_job_mut(job)?.active_set = active;
        let (store, from) = set_phase(t, job, ReconPhase::AddRecords, now)?;
        Ok((store, from, count))
    })?;
    info!(%job, %store, active_volumes = active, full = recon.full, "active volume set fixed");
    announce(engine, recon_handle(job), store, from, ReconPhase::AddRecords);
    Ok(())
}

/// Volumes a reconstruction must replay: committed, non-empty, not AGED, and
/// created after the substore's cutoff when it has one.
pub fn active_volume_set(
    tables: &Tables,
    store: StoreId,
    cutoffs: &HashMap<SubstoreId, Option<DateTime<Utc>>>,
) -> BTreeSet<VolumeId> {
    tables
        .volumes_of(store)
        .filter(|v| v.last_backup_at.is_some() && v.physical_bytes > 0)
        .filter(|v| v.flag != VolumeFlag::Aged)
        .filter(|v| match cutoffs.get(&v.substore).copied().flatten() {
            Some(cutoff) => v.created_at > cutoff,
            None => true,
        })
        .map(|v| v.id)
        .collect()
}

/// Continue a reconstruction parked in `Pending`.
pub fn resume_recon(engine: &Engine, job: JobId) -> Result<ReconReport> {
    let phase = engine
        .ledger()
        .read(|t| t.require_recon_job(job).map(|r| r.phase))?;
    if phase != ReconPhase::Pending {
        return Err(DdbError::InvalidTransition {
            job,
            from: phase.name(),
            to: ReconPhase::AddRecords.name(),
        });
    }
    let handle = recon_handle(job);
    engine.scheduler().resume(handle)?;
    transition(engine, handle, ReconPhase::AddRecords)?;
    info!(%job, "reconstruction resumed");
    drive(engine, handle)
}

/// Snapshot of a reconstruction's progress.
pub fn recon_report(engine: &Engine, job: JobId) -> Result<ReconReport> {
    engine.ledger().read(|t| {
        let recon = t.require_recon_job(job)?;
        let recovered = t.recon_batches(job).len();
        Ok(ReconReport {
            job,
            store: recon.store,
            full: recon.full,
            phase: recon.phase,
            active_volumes: recon.active_set.len(),
            recovered,
            resumes: recon.resumes,
            paused: None,
        })
    })
}

fn recon_handle(job: JobId) -> JobHandle {
    JobHandle {
        id: job,
        kind: JobKind::Recon,
    }
}

fn drive(engine: &Engine, handle: JobHandle) -> Result<ReconReport> {
    let max_resumes = engine.config().recon.max_auto_resumes;
    let delay = engine.config().recon.resume_delay_duration()?;
    let mut auto_resumes = 0;
    loop {
        let step = match add_records(engine, handle) {
            Ok(step) => step,
            Err(e) => return Err(fail(engine, handle, e)),
        };
        let reason = match step {
            Step::Done => return finish(engine, handle),
            Step::Paused(reason) => reason,
        };
        transition(engine, handle, ReconPhase::Pending)?;
        warn!(job = %handle.id, ?reason, "reconstruction paused");

        if reason == PauseReason::OperatorKill || auto_resumes >= max_resumes {
            let mut report = recon_report(engine, handle.id)?;
            report.paused = Some(reason);
            return Ok(report);
        }
        auto_resumes += 1;
        std::thread::sleep(delay);
        transition(engine, handle, ReconPhase::AddRecords)?;
        info!(job = %handle.id, attempt = auto_resumes, "reconstruction resumed automatically");
    }
}

fn add_records(engine: &Engine, handle: JobHandle) -> Result<Step> {
    let batch_size = engine.config().recon.max_volumes_per_batch;
    loop {
        let (store, remaining) = engine.ledger().read(|t| -> Result<_> {
            let recon = t.require_recon_job(handle.id)?;
            let done = t.recon_batches(handle.id);
            let remaining: Vec<VolumeId> = recon.active_set.difference(&done).copied().collect();
            Ok((recon.store, remaining))
        })?;
        if remaining.is_empty() {
            return Ok(Step::Done);
        }
        if kill_requested(engine, handle) {
            return Ok(Step::Paused(PauseReason::OperatorKill));
        }

        let batch = &remaining[..remaining.len().min(batch_size)];
        let volumes = engine.ledger().read(|t| -> Result<Vec<Volume>> {
            batch
                .iter()
                .map(|id| {
                    t.volume(*id).cloned().ok_or_else(|| DdbError::LedgerInconsistency {
                        job: handle.id,
                        detail: format!("{id} is in the active set but no longer in the ledger"),
                    })
                })
                .collect()
        })?;

        let (committed, paused) = process_batch(engine, handle, store, volumes)?;
        engine.events().publish(EngineEvent::ReconBatchCommitted {
            job: handle.id,
            volumes: committed,
            remaining: remaining.len() - committed,
        });
        if let Some(reason) = paused {
            return Ok(Step::Paused(reason));
        }
    }
}

type ScanResult = (Volume, std::result::Result<VolumeScan, ReaderFault>);

/// Read one batch through the helper and checkpoint what it delivered.
/// Returns how many volumes were committed and why the batch stopped early.
fn process_batch(
    engine: &Engine,
    handle: JobHandle,
    store: StoreId,
    volumes: Vec<Volume>,
) -> Result<(usize, Option<PauseReason>)> {
    let expected = volumes.len();
    let timeout = engine.config().recon.helper_timeout_duration()?;
    let parallel = engine.config().recon.parallel_reads;
    let reader = engine.reader_arc();
    let (tx, rx) = crossbeam_channel::unbounded::<ScanResult>();

    std::thread::Builder::new()
        .name("ddb-recon-helper".into())
        .spawn(move || {
            if parallel {
                volumes.par_iter().for_each_with(tx, |tx, v| {
                    let _ = tx.send((v.clone(), reader.scan(v)));
                });
            } else {
                for v in volumes {
                    let scan = reader.scan(&v);
                    let killed = matches!(scan, Err(ReaderFault::Killed));
                    if tx.send((v, scan)).is_err() || killed {
                        break;
                    }
                }
            }
        })?;

    let mut delivered = BatchCommit::new(handle.id);
    let mut paused = None;
    for _ in 0..expected {
        match rx.recv_timeout(timeout) {
            Ok((volume, Ok(scan))) => delivered.add(&volume, Ok(scan)),
            Ok((volume, Err(ReaderFault::Failed(reason)))) => {
                delivered.add(&volume, Err(reason))
            }
            Ok((volume, Err(ReaderFault::Killed))) => {
                warn!(job = %handle.id, volume = %volume.id, "volume helper was killed");
                paused = Some(PauseReason::HelperKilled);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(job = %handle.id, ?timeout, "volume helper unresponsive");
                paused = Some(PauseReason::HelperUnresponsive);
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(job = %handle.id, "volume helper exited before finishing the batch");
                paused = Some(PauseReason::HelperKilled);
                break;
            }
        }
    }
    let committed = delivered.commit(engine, store)?;
    Ok((committed, paused))
}

/// Volumes a batch delivered, held until the batch ends.
struct BatchCommit {
    job: JobId,
    entries: BTreeMap<SubstoreId, Vec<(VolumeId, IndexEntry)>>,
    records: Vec<ReconBatchRecord>,
    failed: Vec<FailedChunkRecord>,
}

impl BatchCommit {
    fn new(job: JobId) -> Self {
        Self {
            job,
            entries: BTreeMap::new(),
            records: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn add(&mut self, volume: &Volume, scan: std::result::Result<VolumeScan, String>) {
        let job = self.job;
        let failed_before = self.failed.len();
        match scan {
            Ok(scan) => {
                self.entries.entry(volume.substore).or_default().push((
                    volume.id,
                    IndexEntry {
                        chunk_count: scan.chunks,
                        bytes: scan.bytes,
                    },
                ));
                self.failed
                    .extend(scan.unreadable.into_iter().map(|(chunk, reason)| {
                        FailedChunkRecord {
                            job,
                            volume: volume.id,
                            chunk: Some(chunk),
                            reason,
                        }
                    }));
            }
            Err(reason) => self.failed.push(FailedChunkRecord {
                job,
                volume: volume.id,
                chunk: None,
                reason,
            }),
        }
        let failed = self.failed.len() - failed_before;
        if failed > 0 {
            warn!(%job, volume = %volume.id, failed, "volume could not be fully recovered");
        }
        self.records.push(ReconBatchRecord {
            job,
            volume: volume.id,
        });
    }

    /// Save each touched substore index once, then write every batch record in
    /// one ledger transaction. A crash between the two only repeats the
    /// (idempotent) index upserts on resume.
    fn commit(self, engine: &Engine, store: StoreId) -> Result<usize> {
        if self.records.is_empty() {
            return Ok(0);
        }
        for (substore, entries) in self.entries {
            let dir = engine.index_dir(store, substore);
            require_write(engine.access(), dir.path())?;
            let _write = engine.quiesce().begin_write(substore)?;
            let mut index = dir.load()?;
            for (volume, entry) in entries {
                index.upsert(volume, entry);
            }
            dir.save(&mut index)?;
        }

        let committed = self.records.len();
        let (records, failed) = (self.records, self.failed);
        engine.ledger().write(|t| {
            for record in records {
                t.insert_recon_batch(record);
            }
            for record in failed {
                t.insert_failed_chunk(record);
            }
            Ok(())
        })?;
        debug!(job = %self.job, committed, "reconstruction batch checkpointed");
        Ok(committed)
    }
}

fn finish(engine: &Engine, handle: JobHandle) -> Result<ReconReport> {
    let job = handle.id;
    let (recon, batches, failed) = engine.ledger().read(|t| -> Result<_> {
        Ok((
            t.require_recon_job(job)?.clone(),
            t.recon_batches(job),
            t.failed_chunks(job).len(),
        ))
    })?;

    if failed > 0 {
        return Err(fail(engine, handle, DdbError::ReconIncomplete { job, failed }));
    }
    if batches != recon.active_set {
        let detail = format!(
            "{} batch record(s) for {} active volume(s)",
            batches.len(),
            recon.active_set.len()
        );
        error!(%job, store = %recon.store, %detail, "reconstruction ledger inconsistency");
        return Err(fail(engine, handle, DdbError::LedgerInconsistency { job, detail }));
    }

    let now = engine.now();
    let (store, from) = engine.ledger().write(|t| {
        let (store, from) = set_phase(t, job, ReconPhase::Completed, now)?;
        let substores: Vec<SubstoreId> = t.require_store(store)?.substores.clone();
        for substore in substores {
            let row = t.substore_mut(substore)?;
            row.recovery_pending = false;
            if recon.full {
                row.last_snap_job = JobId::NONE;
                row.last_snap_at = None;
            }
        }
        if !recon.full {
            t.store_mut(store)?.resync_needed = true;
        }
        Ok((store, from))
    })?;
    announce(engine, handle, store, from, ReconPhase::Completed);
    let substores = engine.ledger().read(|t| t.substores_of(store).map(|s| s.id).collect::<Vec<_>>());
    release_recovery(engine, &substores);
    info!(%job, %store, recovered = batches.len(), full = recon.full, "reconstruction complete");
    recon_report(engine, job)
}

/// Move the job to `to` inside an open transaction. Returns the store and the previous phase.
fn set_phase(
    t: &mut Tables,
    job: JobId,
    to: ReconPhase,
    now: DateTime<Utc>,
) -> Result<(StoreId, ReconPhase)> {
    let recon = t.recon_job_mut(job)?;
    let from = recon.phase;
    if !from.can_transition_to(to) {
        return Err(DdbError::InvalidTransition {
            job,
            from: from.name(),
            to: to.name(),
        });
    }
    recon.phase = to;
    if from == ReconPhase::Pending && to == ReconPhase::AddRecords {
        recon.resumes += 1;
    }
    if to.is_terminal() {
        recon.finished_at = Some(now);
    }
    let store = recon.store;

    let row = t.job_mut(job)?;
    row.status = job_status_for(to);
    if to.is_terminal() {
        row.finished_at = Some(now);
    }
    Ok((store, from))
}

fn job_status_for(phase: ReconPhase) -> JobStatus {
    match phase {
        ReconPhase::Pending => JobStatus::Pending,
        ReconPhase::Completed => JobStatus::Completed,
        ReconPhase::Failed => JobStatus::Failed,
        _ => JobStatus::Running,
    }
}

fn transition(engine: &Engine, handle: JobHandle, to: ReconPhase) -> Result<()> {
    let now = engine.now();
    let (store, from) = engine
        .ledger()
        .write(|t| set_phase(t, handle.id, to, now))?;
    announce(engine, handle, store, from, to);
    Ok(())
}

fn announce(engine: &Engine, handle: JobHandle, store: StoreId, from: ReconPhase, to: ReconPhase) {
    debug!(job = %handle.id, %store, %from, %to, "reconstruction phase changed");
    if let Err(e) = engine.scheduler().update(handle, job_status_for(to)) {
        warn!(job = %handle.id, "failed to report phase to scheduler: {e}");
    }
    engine.events().publish(EngineEvent::ReconPhaseChanged {
        job: handle.id,
        store,
        from,
        to,
    });
}

/// Drop the in-process recovery claims. The ledger's `recovery_pending` flags
/// stay authoritative for whether backups may start.
fn release_recovery(engine: &Engine, substores: &[SubstoreId]) {
    for substore in substores {
        engine.quiesce().end_recovery(*substore);
    }
}

/// Move the job to `Failed` and hand back the error that caused it.
fn fail(engine: &Engine, handle: JobHandle, err: DdbError) -> DdbError {
    if let Err(e) = transition(engine, handle, ReconPhase::Failed) {
        warn!(job = %handle.id, "failed to record reconstruction failure: {e}");
    }
    let substores = engine.ledger().read(|t| {
        t.recon_job(handle.id)
            .map(|r| t.substores_of(r.store).map(|s| s.id).collect::<Vec<_>>())
            .unwrap_or_default()
    });
    release_recovery(engine, &substores);
    err
}
