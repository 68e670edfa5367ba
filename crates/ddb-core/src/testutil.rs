use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::access::{AccessControl, PathGate};
use crate::clock::{Clock, ManualClock};
use crate::commands::backup::begin_backup;
use crate::commands::store::create_store;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::ledger::model::Volume;
use crate::ledger::{LedgerBackend, MemoryBackend};
use crate::reader::{ReaderFault, VolumeReader, VolumeScan};
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Config rooted in `root` with timeouts short enough for tests.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.paths.index_root = root.join("index");
    config.paths.backup_dir = root.join("backups");
    config.recon.helper_timeout = "2s".into();
    config.recon.resume_delay = "10ms".into();
    config.quiesce.drain_timeout = "500ms".into();
    config.quiesce.writer_block_timeout = "2s".into();
    config.reclaim.timeout = "5s".into();
    config
}

/// What the scripted reader does the next time it sees a volume.
#[derive(Debug, Clone)]
pub enum ReadScript {
    Kill,
    Fail(String),
    Unreadable(Vec<u64>),
    Hang(Duration),
}

/// Volume reader that trusts the ledger unless a script says otherwise.
#[derive(Default)]
pub struct ScriptedReader {
    scripts: Mutex<HashMap<VolumeId, VecDeque<ReadScript>>>,
    reads: Mutex<Vec<VolumeId>>,
}

impl ScriptedReader {
    pub fn script(&self, volume: VolumeId, step: ReadScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(volume)
            .or_default()
            .push_back(step);
    }

    pub fn reads(&self) -> Vec<VolumeId> {
        self.reads.lock().unwrap().clone()
    }
}

impl VolumeReader for ScriptedReader {
    fn scan(&self, volume: &Volume) -> std::result::Result<VolumeScan, ReaderFault> {
        self.reads.lock().unwrap().push(volume.id);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&volume.id)
            .and_then(VecDeque::pop_front);
        let mut scan = VolumeScan {
            chunks: volume.chunk_count,
            bytes: volume.physical_bytes,
            unreadable: Vec::new(),
        };
        match step {
            None => {}
            Some(ReadScript::Kill) => return Err(ReaderFault::Killed),
            Some(ReadScript::Fail(reason)) => return Err(ReaderFault::Failed(reason)),
            Some(ReadScript::Unreadable(chunks)) => {
                scan.unreadable = chunks.into_iter().map(|c| (c, "crc mismatch".into())).collect();
            }
            Some(ReadScript::Hang(d)) => std::thread::sleep(d),
        }
        Ok(scan)
    }
}

/// Access gate that stalls every check for a while, then defers to a [`PathGate`].
pub struct SlowGate {
    pub delay: Duration,
    pub inner: PathGate,
}

impl AccessControl for SlowGate {
    fn write_permitted(&self, path: &Path) -> bool {
        std::thread::sleep(self.delay);
        self.inner.write_permitted(path)
    }
}

/// Ledger backend whose commits can be made to fail.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    pub fail_commits: AtomicBool,
}

impl LedgerBackend for FlakyBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        self.inner.load()
    }

    fn commit(&self, snapshot: &[u8]) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DdbError::Other("injected commit failure".into()));
        }
        self.inner.commit(snapshot)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub gate: Arc<PathGate>,
    pub reader: Arc<ScriptedReader>,
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(tweak: impl FnOnce(&mut EngineConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let clock = Arc::new(ManualClock::new(start_time()));
    let gate = Arc::new(PathGate::new());
    let reader = Arc::new(ScriptedReader::default());
    let engine = Engine::builder(config)
        .clock(clock.clone())
        .access(gate.clone())
        .reader(reader.clone())
        .open()
        .unwrap();
    Fixture {
        dir,
        engine,
        clock,
        gate,
        reader,
    }
}

impl Fixture {
    pub fn store(&self, name: &str, partitions: usize) -> (StoreId, Vec<SubstoreId>) {
        let store = create_store(&self.engine, name, partitions).unwrap();
        let substores = self
            .engine
            .ledger()
            .read(|t| t.require_store(store).unwrap().substores.clone());
        (store, substores)
    }

    /// Commit a backup that writes one new volume.
    pub fn backup(&self, store: StoreId, substore: SubstoreId, bytes: u64) -> (JobId, VolumeId) {
        let mut session = begin_backup(&self.engine, store).unwrap();
        let volume = session.write_volume(substore, bytes, bytes / 64 + 1).unwrap();
        let job = session.commit().unwrap();
        (job, volume)
    }

    pub fn advance_days(&self, days: i64) {
        self.clock.advance(chrono::Duration::days(days));
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
