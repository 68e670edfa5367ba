use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::access::{AccessControl, AllowAll};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::index::{IndexDir, IndexLayout};
use crate::jobs::{JobScheduler, LocalScheduler};
use crate::ledger::model::{JobStatus, ReconPhase};
use crate::ledger::{FileBackend, Ledger, LedgerBackend, MemoryBackend};
use crate::quiesce::QuiesceCoordinator;
use crate::reader::{LedgerVolumeReader, VolumeReader};
use ddb_types::{JobId, StoreId, SubstoreId};

/// Handle to the engine's shared state. Cloning is cheap; every clone talks
/// to the same ledger, coordinator, and collaborators.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    ledger: Ledger,
    scheduler: Arc<dyn JobScheduler>,
    access: Arc<dyn AccessControl>,
    reader: Arc<dyn VolumeReader>,
    clock: Arc<dyn Clock>,
    quiesce: Arc<QuiesceCoordinator>,
    events: EventBus,
    layout: IndexLayout,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn scheduler(&self) -> &dyn JobScheduler {
        self.inner.scheduler.as_ref()
    }

    pub fn access(&self) -> &dyn AccessControl {
        self.inner.access.as_ref()
    }

    pub(crate) fn reader_arc(&self) -> Arc<dyn VolumeReader> {
        Arc::clone(&self.inner.reader)
    }

    pub fn reader(&self) -> &dyn VolumeReader {
        self.inner.reader.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn quiesce(&self) -> &Arc<QuiesceCoordinator> {
        &self.inner.quiesce
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.inner.layout
    }

    pub fn index_dir(&self, store: StoreId, substore: SubstoreId) -> IndexDir {
        self.inner.layout.dir(store, substore)
    }

    /// Where the DDB backup taken by `job` keeps its copy of `substore`.
    pub fn backup_copy_dir(&self, job: JobId, substore: SubstoreId) -> PathBuf {
        self.inner
            .config
            .paths
            .backup_dir
            .join(format!("job-{}", job.get()))
            .join(format!("substore-{}", substore.get()))
    }
}

/// Assembles an [`Engine`]; every collaborator has a local default.
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Box<dyn LedgerBackend>>,
    scheduler: Option<Arc<dyn JobScheduler>>,
    access: Option<Arc<dyn AccessControl>>,
    reader: Option<Arc<dyn VolumeReader>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backend: None,
            scheduler: None,
            access: None,
            reader: None,
            clock: None,
        }
    }

    pub fn ledger_backend(mut self, backend: Box<dyn LedgerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn VolumeReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn open(self) -> Result<Engine> {
        self.config.validate()?;

        let backend: Box<dyn LedgerBackend> = match self.backend {
            Some(backend) => backend,
            None => match &self.config.paths.ledger {
                Some(path) => Box::new(FileBackend::new(path.clone())),
                None => Box::new(MemoryBackend::new()),
            },
        };
        let ledger = Ledger::open(backend)?;

        let scheduler = match self.scheduler {
            Some(s) => s,
            None => Arc::new(LocalScheduler::starting_after(
                ledger.read(|t| t.max_job_id()),
            )),
        };
        let quiesce = Arc::new(QuiesceCoordinator::new(
            self.config.quiesce.drain_timeout_duration()?,
            self.config.quiesce.writer_block_timeout_duration()?,
        ));
        let layout = IndexLayout::new(
            self.config.paths.index_root.clone(),
            self.config.quiesce.stale_marker_duration()?,
        );

        let engine = Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                ledger,
                scheduler,
                access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
                reader: self.reader.unwrap_or_else(|| Arc::new(LedgerVolumeReader)),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                quiesce,
                events: EventBus::new(),
                layout,
            }),
        };
        settle_interrupted_recon(&engine)?;
        debug!(index_root = %engine.layout().root().display(), "engine opened");
        Ok(engine)
    }
}

/// Settle reconstructions that a process exit left mid-flight.
///
/// A job cut off in `AddRecords` has a fixed active set and checkpoints, so it
/// is parked in `Pending` for `resume_recon`. A job that never got that far may
/// have left its indexes half reset or restored; it is failed, and its
/// substores keep `recovery_pending` so backups stay refused until a new
/// reconstruction completes.
fn settle_interrupted_recon(engine: &Engine) -> Result<()> {
    let interrupted: Vec<(JobId, ReconPhase)> = engine.ledger().read(|t| {
        t.stores()
            .filter_map(|s| t.open_recon_job(s.id))
            .filter(|r| r.phase != ReconPhase::Pending)
            .map(|r| (r.id, r.phase))
            .collect()
    });
    if interrupted.is_empty() {
        return Ok(());
    }
    let now = engine.now();
    engine.ledger().write(|t| {
        for (job, phase) in &interrupted {
            let (to, status) = match phase {
                ReconPhase::AddRecords => (ReconPhase::Pending, JobStatus::Pending),
                _ => (ReconPhase::Failed, JobStatus::Failed),
            };
            let recon = t.recon_job_mut(*job)?;
            recon.phase = to;
            if to.is_terminal() {
                recon.finished_at = Some(now);
            }
            let row = t.job_mut(*job)?;
            row.status = status;
            if status.is_terminal() {
                row.finished_at = Some(now);
            }
        }
        Ok(())
    })?;
    for (job, phase) in interrupted {
        match phase {
            ReconPhase::AddRecords => {
                warn!(%job, "reconstruction was interrupted; parked as pending")
            }
            _ => warn!(%job, %phase, "reconstruction was interrupted before replay; marked failed"),
        }
    }
    Ok(())
}
