use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{DdbError, Result};
use crate::ledger::model::ReconPhase;
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// Notifications published by the engine as lifecycle transitions commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Quiesced {
        substore: SubstoreId,
    },
    Unquiesced {
        substore: SubstoreId,
    },
    ReconPhaseChanged {
        job: JobId,
        store: StoreId,
        from: ReconPhase,
        to: ReconPhase,
    },
    ReconBatchCommitted {
        job: JobId,
        volumes: usize,
        remaining: usize,
    },
    ResyncFinished {
        store: StoreId,
        attempt: u32,
        status: i32,
    },
    VolumesAged {
        store: StoreId,
        volumes: Vec<VolumeId>,
    },
    StoreSealed {
        store: StoreId,
    },
    StoreMacroPruned {
        store: StoreId,
    },
}

/// Fan-out of engine events to any number of subscribers.
///
/// Disconnected subscribers are dropped on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Block until `job` reaches `phase`, or fail after `timeout`.
///
/// Polling adapter for callers that want a simple "wait for phase" call on
/// top of the event stream.
pub fn wait_for_recon_phase(
    events: &Receiver<EngineEvent>,
    job: JobId,
    phase: ReconPhase,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(EngineEvent::ReconPhaseChanged { job: j, to, .. }) if j == job && to == phase => {
                return Ok(());
            }
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => {
                return Err(DdbError::Timeout(format!(
                    "{job} did not reach phase {phase} within {timeout:?}"
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DdbError::Other("event channel closed".into()));
            }
        }
    }
}
