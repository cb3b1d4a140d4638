//! Replays a recorded orientation log through the live listener interface.
//!
//! Each record is delivered at `anchor + offset` where the anchor is taken
//! from the monotonic clock when the replay starts and stands in for the
//! recording session start, so the original capture cadence (including any
//! lead-in before the first sample) is reproduced even for irregular sampling.
//!
//! ```text
//! Idle --start--> Started --last record--> Finished --notified--> Idle
//!                    \--stop------------------------------------> Idle
//! ```
//!
//! Corrupt records end the replay early: everything before the corruption is
//! delivered, the error goes out through `on_source_error`, then the replay
//! finishes normally.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::SampleReader;
use crate::error::SourceError;
use crate::listeners::{notify_error, notify_sample, DeliveryGate, ListenerSet, OrientationListener};
use crate::source::{Orientation, OrientationSample, OrientationSource, ReplayControl, SourceKind};
use crate::storage::open_reader;
use crate::utils::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPhase {
    Idle,
    Started,
    Finished,
}

impl std::fmt::Display for ReplayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayPhase::Idle => write!(f, "idle"),
            ReplayPhase::Started => write!(f, "started"),
            ReplayPhase::Finished => write!(f, "finished"),
        }
    }
}

/// Position in the open log during a replay
struct ReplayCursor {
    reader: SampleReader<BufReader<File>>,
    anchor: Instant,
    /// Next record to deliver
    pending: Option<OrientationSample>,
    /// Why the log ended early, reported before finishing
    truncated: Option<SourceError>,
}

impl ReplayCursor {
    fn open(path: &Path) -> Result<Self, SourceError> {
        let reader = open_reader(path)?;
        let mut cursor = ReplayCursor {
            reader,
            anchor: Instant::now(),
            pending: None,
            truncated: None,
        };
        cursor.advance();
        Ok(cursor)
    }

    /// Load the next record into `pending`, stopping at corruption or I/O errors
    fn advance(&mut self) {
        self.pending = match self.reader.next_sample() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(
                    "replay log truncated after {} records: {}",
                    self.reader.records_read(),
                    e
                );
                self.truncated = Some(e);
                None
            }
        };
    }

    fn due_at(&self, sample: &OrientationSample) -> Instant {
        self.anchor + Duration::from_millis(u64::from(sample.offset_millis))
    }
}

struct ReplayState {
    file: Option<PathBuf>,
    phase: ReplayPhase,
    /// Bumped on every start and stop; a task only acts for its own generation
    generation: u64,
    cursor: Option<ReplayCursor>,
    task: Option<JoinHandle<()>>,
    current: Orientation,
    delivered: u64,
}

struct ReplayShared {
    state: Mutex<ReplayState>,
    listeners: ListenerSet,
    gate: DeliveryGate,
}

/// Orientation source fed from a recorded log
pub struct ReplayingSource {
    shared: Arc<ReplayShared>,
    runtime: Handle,
}

impl ReplayingSource {
    /// Replay deliveries are scheduled on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        ReplayingSource {
            shared: Arc::new(ReplayShared {
                state: Mutex::new(ReplayState {
                    file: None,
                    phase: ReplayPhase::Idle,
                    generation: 0,
                    cursor: None,
                    task: None,
                    current: Orientation::default(),
                    delivered: 0,
                }),
                listeners: ListenerSet::new(),
                gate: DeliveryGate::new(),
            }),
            runtime,
        }
    }

    pub fn phase(&self) -> ReplayPhase {
        lock_unpoisoned(&self.shared.state).phase
    }

    pub fn file(&self) -> Option<PathBuf> {
        lock_unpoisoned(&self.shared.state).file.clone()
    }

    /// Records delivered in the current or last session
    pub fn delivered(&self) -> u64 {
        lock_unpoisoned(&self.shared.state).delivered
    }
}

enum Step {
    Deliver(OrientationSample, Option<SourceError>),
    Exhausted(Option<SourceError>),
    Stale,
}

impl ReplayShared {
    async fn run(self: Arc<Self>, generation: u64) {
        loop {
            let due = {
                let state = lock_unpoisoned(&self.state);
                if state.generation != generation {
                    return;
                }
                let Some(cursor) = state.cursor.as_ref() else {
                    return;
                };
                cursor.pending.as_ref().map(|s| cursor.due_at(s))
            };
            if let Some(due) = due {
                tokio::time::sleep_until(due).await;
            }

            let finished = self.gate.deliver(|| match self.step(generation) {
                Step::Deliver(sample, truncated) => {
                    let listeners = self.listeners.snapshot();
                    notify_sample(&listeners, &sample);
                    if let Some(e) = truncated {
                        notify_error(&listeners, &e);
                    }
                    Some(false)
                }
                Step::Exhausted(truncated) => {
                    let listeners = self.listeners.snapshot();
                    if let Some(e) = truncated {
                        notify_error(&listeners, &e);
                    }
                    for listener in &listeners {
                        listener.on_replay_finished();
                    }
                    Some(true)
                }
                Step::Stale => None,
            });

            match finished {
                Some(false) => continue,
                Some(true) => {
                    self.settle(generation);
                    return;
                }
                None => return,
            }
        }
    }

    /// Take the pending record, or close the cursor when there is none
    fn step(&self, generation: u64) -> Step {
        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;
        if state.generation != generation || state.phase != ReplayPhase::Started {
            return Step::Stale;
        }
        let Some(cursor) = state.cursor.as_mut() else {
            return Step::Stale;
        };
        match cursor.pending.take() {
            Some(sample) => {
                cursor.advance();
                // report truncation right after the last good record
                let truncated = if cursor.pending.is_none() { cursor.truncated.take() } else { None };
                state.current = sample.orientation();
                state.delivered += 1;
                Step::Deliver(sample, truncated)
            }
            None => {
                let truncated = cursor.truncated.take();
                state.cursor = None;
                state.phase = ReplayPhase::Finished;
                tracing::info!("replay finished after {} records", state.delivered);
                Step::Exhausted(truncated)
            }
        }
    }

    // Finished -> Idle, unless a listener already restarted the replay
    fn settle(&self, generation: u64) {
        let mut state = lock_unpoisoned(&self.state);
        if state.generation == generation && state.phase == ReplayPhase::Finished {
            state.phase = ReplayPhase::Idle;
            state.task = None;
        }
    }
}

impl OrientationSource for ReplayingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Replaying
    }

    /// Open the selected log and begin delivering from its first record.
    fn start(&self) -> Result<(), SourceError> {
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.phase == ReplayPhase::Started {
            return Ok(());
        }
        let path = state.file.clone().ok_or(SourceError::NoReplayFile)?;
        let cursor = ReplayCursor::open(&path)?;

        state.generation += 1;
        state.phase = ReplayPhase::Started;
        state.cursor = Some(cursor);
        state.delivered = 0;
        let generation = state.generation;
        let task = self.runtime.spawn(Arc::clone(&self.shared).run(generation));
        if let Some(previous) = state.task.replace(task) {
            previous.abort();
        }
        tracing::info!("replaying {}", path.display());
        Ok(())
    }

    /// Cancel the pending delivery and close the log. No notification fires
    /// after this returns.
    fn stop(&self) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.phase != ReplayPhase::Started {
                return;
            }
            state.generation += 1;
            state.phase = ReplayPhase::Idle;
            state.cursor = None;
            if let Some(task) = state.task.take() {
                task.abort();
            }
            tracing::info!("replay stopped after {} records", state.delivered);
        }
        self.shared.gate.wait_idle();
    }

    fn is_started(&self) -> bool {
        self.phase() == ReplayPhase::Started
    }

    fn orientation(&self) -> Orientation {
        lock_unpoisoned(&self.shared.state).current
    }

    fn add_listener(&self, listener: &Arc<dyn OrientationListener>) {
        self.shared.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn OrientationListener>) {
        self.shared.listeners.remove(listener);
    }
}

impl ReplayControl for ReplayingSource {
    /// Select the log for the next `start`. A running replay is unaffected.
    fn set_file(&self, path: &Path) -> Result<(), SourceError> {
        if !path.is_file() {
            return Err(SourceError::not_found(path, "no such file"));
        }
        // header check only; records are validated while replaying
        drop(open_reader(path)?);
        lock_unpoisoned(&self.shared.state).file = Some(path.to_path_buf());
        Ok(())
    }

    fn is_replaying(&self) -> bool {
        self.is_started()
    }
}

impl Drop for ReplayingSource {
    fn drop(&mut self) {
        self.stop();
    }
}
