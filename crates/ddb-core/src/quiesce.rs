//! Per-substore write fence.
//!
//! A substore is quiesced while its index files are copied or replaced. The
//! in-process gate blocks new writers and drains in-flight ones; the on-disk
//! marker keeps the index read-only across process restarts until the token
//! is released.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::events::EngineEvent;
use crate::index::{IndexDir, QuiesceMarker};
use ddb_types::SubstoreId;

#[derive(Debug, Default)]
struct Gate {
    quiesced: bool,
    in_flight: usize,
    sessions: usize,
    /// Claimed by a reconstruction; new backup sessions are refused.
    recovering: bool,
}

pub struct QuiesceCoordinator {
    gates: Mutex<HashMap<SubstoreId, Gate>>,
    changed: Condvar,
    drain_timeout: Duration,
    writer_block_timeout: Duration,
}

impl QuiesceCoordinator {
    pub fn new(drain_timeout: Duration, writer_block_timeout: Duration) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            drain_timeout,
            writer_block_timeout,
        }
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<SubstoreId, Gate>> {
        self.gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_quiesced(&self, substore: SubstoreId) -> bool {
        self.gates().get(&substore).is_some_and(|g| g.quiesced)
    }

    /// Number of backup sessions currently registered against `substore`.
    pub fn live_writers(&self, substore: SubstoreId) -> usize {
        self.gates().get(&substore).map_or(0, |g| g.sessions)
    }

    /// Close the gate and wait for in-flight writes to drain.
    ///
    /// On drain timeout the gate is reopened, so a failed quiesce leaves the
    /// substore exactly as it was.
    fn close(&self, substore: SubstoreId) -> Result<()> {
        let mut gates = self.gates();
        let gate = gates.entry(substore).or_default();
        if gate.quiesced {
            return Err(DdbError::AlreadyQuiesced(substore));
        }
        gate.quiesced = true;

        let (mut gates, wait) = self
            .changed
            .wait_timeout_while(gates, self.drain_timeout, |g| {
                g.get(&substore).is_some_and(|g| g.in_flight > 0)
            })
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() {
            let in_flight = gates.get(&substore).map_or(0, |g| g.in_flight);
            if let Some(gate) = gates.get_mut(&substore) {
                gate.quiesced = false;
            }
            drop(gates);
            self.changed.notify_all();
            return Err(DdbError::Timeout(format!(
                "{substore}: {in_flight} write(s) still in flight after {:?}",
                self.drain_timeout
            )));
        }
        Ok(())
    }

    fn open(&self, substore: SubstoreId) {
        if let Some(gate) = self.gates().get_mut(&substore) {
            gate.quiesced = false;
        }
        self.changed.notify_all();
    }

    /// Enter a write against `substore`, blocking while it is quiesced.
    pub fn begin_write(self: &Arc<Self>, substore: SubstoreId) -> Result<WriteGuard> {
        let gates = self.gates();
        let (mut gates, wait) = self
            .changed
            .wait_timeout_while(gates, self.writer_block_timeout, |g| {
                g.get(&substore).is_some_and(|g| g.quiesced)
            })
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() {
            return Err(DdbError::Timeout(format!(
                "{substore} stayed quiesced for {:?}",
                self.writer_block_timeout
            )));
        }
        gates.entry(substore).or_default().in_flight += 1;
        Ok(WriteGuard {
            coordinator: Arc::clone(self),
            substore,
        })
    }

    /// Register a backup session as a live writer of `substore`.
    ///
    /// Refused once a reconstruction has claimed the substore.
    pub fn register_writer(self: &Arc<Self>, substore: SubstoreId) -> Result<WriterSession> {
        let mut gates = self.gates();
        let gate = gates.entry(substore).or_default();
        if gate.recovering {
            return Err(DdbError::InvalidState(format!(
                "{substore} is being recovered; backups are refused"
            )));
        }
        gate.sessions += 1;
        Ok(WriterSession {
            coordinator: Arc::clone(self),
            substore,
        })
    }

    /// Claim `substore` for a reconstruction.
    ///
    /// The live-writer check and the claim happen under one lock, so a backup
    /// session either registered first (and the claim fails) or is refused.
    pub fn begin_recovery(&self, substore: SubstoreId) -> Result<()> {
        let mut gates = self.gates();
        let gate = gates.entry(substore).or_default();
        if gate.sessions > 0 {
            return Err(DdbError::RecoveryPreconditionUnmet {
                substore,
                live_writers: gate.sessions,
            });
        }
        gate.recovering = true;
        Ok(())
    }

    pub fn end_recovery(&self, substore: SubstoreId) {
        if let Some(gate) = self.gates().get_mut(&substore) {
            gate.recovering = false;
        }
    }

    pub fn is_recovering(&self, substore: SubstoreId) -> bool {
        self.gates().get(&substore).is_some_and(|g| g.recovering)
    }
}

/// One in-flight write. Dropping it lets a pending quiesce proceed.
pub struct WriteGuard {
    coordinator: Arc<QuiesceCoordinator>,
    substore: SubstoreId,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(gate) = self.coordinator.gates().get_mut(&self.substore) {
            gate.in_flight = gate.in_flight.saturating_sub(1);
        }
        self.coordinator.changed.notify_all();
    }
}

/// Registration of a backup session against a substore.
pub struct WriterSession {
    coordinator: Arc<QuiesceCoordinator>,
    substore: SubstoreId,
}

impl WriterSession {
    pub fn substore(&self) -> SubstoreId {
        self.substore
    }
}

impl Drop for WriterSession {
    fn drop(&mut self) {
        if let Some(gate) = self.coordinator.gates().get_mut(&self.substore) {
            gate.sessions = gate.sessions.saturating_sub(1);
        }
    }
}

/// Proof that a substore is quiesced. Dropping the token unquiesces it.
pub struct QuiesceToken {
    engine: Engine,
    dir: IndexDir,
    marker: QuiesceMarker,
    released: bool,
}

impl QuiesceToken {
    pub fn substore(&self) -> SubstoreId {
        self.dir.substore()
    }

    pub fn dir(&self) -> &IndexDir {
        &self.dir
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let substore = self.dir.substore();
        let cleared = self.dir.clear_quiesce_marker(&self.marker);
        self.engine.quiesce().open(substore);
        self.engine
            .events()
            .publish(EngineEvent::Unquiesced { substore });
        debug!(%substore, "substore unquiesced");
        cleared
    }
}

impl Drop for QuiesceToken {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(substore = %self.dir.substore(), "failed to remove quiesce marker: {e}");
        }
    }
}

/// Quiesce `substore`: block new writes, drain in-flight ones, and mark the
/// index directory read-only.
///
/// A second quiesce of the same substore fails with `AlreadyQuiesced`, also
/// when the first one was taken by another process.
pub fn quiesce(engine: &Engine, substore: SubstoreId) -> Result<QuiesceToken> {
    let store = engine.ledger().read(|t| t.require_substore(substore).map(|s| s.store))?;
    let dir = engine.index_dir(store, substore);

    engine.quiesce().close(substore)?;
    let marker = match dir.create_quiesce_marker(chrono::Utc::now()) {
        Ok(marker) => marker,
        Err(e) => {
            engine.quiesce().open(substore);
            if let Some(holder) = dir.live_marker() {
                info!(
                    %substore,
                    holder = %holder.hostname,
                    pid = holder.pid,
                    "substore already quiesced by another holder"
                );
            }
            return Err(e);
        }
    };
    engine.events().publish(EngineEvent::Quiesced { substore });
    debug!(%substore, "substore quiesced");

    Ok(QuiesceToken {
        engine: engine.clone(),
        dir,
        marker,
        released: false,
    })
}

/// Release a quiesce, reporting a marker that could not be removed.
pub fn unquiesce(mut token: QuiesceToken) -> Result<()> {
    token.release()
}
