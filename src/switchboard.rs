//! Coordinator that keeps exactly one orientation source feeding the renderer.
//!
//! The switchboard owns the live (recording) and replaying sources and the
//! renderer-facing listeners. Renderers are only ever registered with the
//! active source; a switch unregisters them from the old source and stops it
//! (which waits out any in-flight delivery) before starting the new one.
//!
//! Two locks: `switch` serialises transitions and may be held while a source
//! drains its deliveries; `board` guards the active tag and renderer list and
//! is never held across a source's `stop()`. Getters only take `board`, so a
//! renderer may query the switchboard from inside a callback while a switch
//! is in progress. Transitions themselves must not be called from callbacks.

use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::listeners::OrientationListener;
use crate::source::{
    Orientation, OrientationSample, OrientationSource, RecordControl, RecordingSummary, ReplayControl,
};
use crate::storage::LogStore;
use crate::utils::lock_unpoisoned;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSource {
    Recording,
    Replaying { log_id: String },
}

struct Board {
    active: ActiveSource,
    renderers: Vec<Arc<dyn OrientationListener>>,
}

struct Inner<R, P> {
    recording: Arc<R>,
    replaying: Arc<P>,
    store: LogStore,
    switch: Mutex<()>,
    board: Mutex<Board>,
    // kept alive here; the replaying source only holds it weakly
    _relay: Arc<dyn OrientationListener>,
}

/// Forwards "replay finished" to the switchboard task without blocking the
/// replay delivery path.
struct FinishedRelay {
    tx: mpsc::UnboundedSender<()>,
}

impl OrientationListener for FinishedRelay {
    fn on_orientation_changed(&self, _sample: &OrientationSample) {}

    fn on_replay_finished(&self) {
        let _ = self.tx.send(());
    }
}

pub struct Switchboard<R, P> {
    inner: Arc<Inner<R, P>>,
}

impl<R, P> Clone for Switchboard<R, P> {
    fn clone(&self) -> Self {
        Switchboard { inner: Arc::clone(&self.inner) }
    }
}

impl<R, P> Switchboard<R, P>
where
    R: RecordControl + 'static,
    P: ReplayControl + 'static,
{
    /// The recording source starts out active (but not started).
    pub fn new(recording: Arc<R>, replaying: Arc<P>, store: LogStore, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay: Arc<dyn OrientationListener> = Arc::new(FinishedRelay { tx });
        replaying.add_listener(&relay);

        let inner = Arc::new(Inner {
            recording,
            replaying,
            store,
            switch: Mutex::new(()),
            board: Mutex::new(Board { active: ActiveSource::Recording, renderers: Vec::new() }),
            _relay: relay,
        });

        let weak: Weak<Inner<R, P>> = Arc::downgrade(&inner);
        runtime.spawn(async move {
            while rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_replay_finished();
            }
        });

        Switchboard { inner }
    }

    pub fn recording(&self) -> &Arc<R> {
        &self.inner.recording
    }

    pub fn replaying(&self) -> &Arc<P> {
        &self.inner.replaying
    }

    pub fn active(&self) -> ActiveSource {
        lock_unpoisoned(&self.inner.board).active.clone()
    }

    /// Start the live source if it is the active one
    pub fn start(&self) -> Result<(), SourceError> {
        let _switch = lock_unpoisoned(&self.inner.switch);
        let active = self.active();
        match active {
            ActiveSource::Recording => self.inner.recording.start(),
            ActiveSource::Replaying { .. } => Ok(()),
        }
    }

    /// Register a renderer with whichever source is active
    pub fn attach_renderer(&self, renderer: Arc<dyn OrientationListener>) {
        let mut board = lock_unpoisoned(&self.inner.board);
        if board.renderers.iter().any(|r| Arc::ptr_eq(r, &renderer)) {
            return;
        }
        self.inner.active_source(&board.active).add_listener(&renderer);
        board.renderers.push(renderer);
    }

    pub fn detach_renderer(&self, renderer: &Arc<dyn OrientationListener>) {
        let mut board = lock_unpoisoned(&self.inner.board);
        self.inner.recording.remove_listener(renderer);
        self.inner.replaying.remove_listener(renderer);
        board.renderers.retain(|r| !Arc::ptr_eq(r, renderer));
    }

    pub fn start_recording(&self, id: &str) -> Result<(), SourceError> {
        self.inner.recording.start_recording(id)
    }

    pub fn stop_recording(&self) -> Result<Option<RecordingSummary>, SourceError> {
        self.inner.recording.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.is_recording()
    }

    pub fn is_replaying(&self) -> bool {
        self.inner.replaying.is_replaying()
    }

    /// Replay the log `id` in place of live data.
    ///
    /// If the log cannot be selected nothing changes. If the replay cannot
    /// start, live data is restored.
    pub fn start_replaying(&self, id: &str) -> Result<(), SourceError> {
        let inner = &self.inner;
        let _switch = lock_unpoisoned(&inner.switch);

        let path = inner.store.resolve(id)?;
        inner.replaying.set_file(&path)?;

        let previous = {
            let mut board = lock_unpoisoned(&inner.board);
            if board.active == ActiveSource::Recording {
                inner.move_renderers(&board, inner.recording.as_ref(), inner.replaying.as_ref());
            }
            std::mem::replace(&mut board.active, ActiveSource::Replaying { log_id: id.to_string() })
        };
        match previous {
            ActiveSource::Recording => inner.recording.stop(),
            ActiveSource::Replaying { .. } => inner.replaying.stop(),
        }

        if let Err(e) = inner.replaying.start() {
            tracing::warn!("cannot replay {}: {}", id, e);
            if let Err(e) = inner.activate_recording() {
                tracing::error!("{} source did not restart: {}", inner.recording.kind(), e);
            }
            return Err(e);
        }

        tracing::info!("switched to {} source, log {}", inner.replaying.kind(), id);
        Ok(())
    }

    /// Abandon the replay and return to live data immediately
    pub fn stop_replaying(&self) -> Result<(), SourceError> {
        let _switch = lock_unpoisoned(&self.inner.switch);
        if self.active() == ActiveSource::Recording {
            return Ok(());
        }
        self.inner.activate_recording()
    }

    pub fn heading(&self) -> f32 {
        self.orientation().heading
    }

    pub fn orientation(&self) -> Orientation {
        let board = lock_unpoisoned(&self.inner.board);
        self.inner.active_source(&board.active).orientation()
    }

    /// Stop everything and close any open recording
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let _switch = lock_unpoisoned(&inner.switch);
        {
            let mut board = lock_unpoisoned(&inner.board);
            if board.active != ActiveSource::Recording {
                inner.move_renderers(&board, inner.replaying.as_ref(), inner.recording.as_ref());
                board.active = ActiveSource::Recording;
            }
        }
        inner.replaying.stop();
        inner.recording.stop();
        match inner.recording.stop_recording() {
            Ok(Some(summary)) => tracing::info!("closed recording {} on shutdown", summary.id),
            Ok(None) => {}
            Err(e) => tracing::error!("closing recording on shutdown failed: {}", e),
        }
        tracing::info!("switchboard shut down");
    }
}

impl<R, P> Inner<R, P>
where
    R: RecordControl + 'static,
    P: ReplayControl + 'static,
{
    fn active_source(&self, active: &ActiveSource) -> &dyn OrientationSource {
        match active {
            ActiveSource::Recording => self.recording.as_ref(),
            ActiveSource::Replaying { .. } => self.replaying.as_ref(),
        }
    }

    fn move_renderers(&self, board: &Board, from: &dyn OrientationSource, to: &dyn OrientationSource) {
        for r in &board.renderers {
            from.remove_listener(r);
            to.add_listener(r);
        }
    }

    /// Caller holds `switch`.
    fn activate_recording(&self) -> Result<(), SourceError> {
        {
            let mut board = lock_unpoisoned(&self.board);
            if board.active != ActiveSource::Recording {
                self.move_renderers(&board, self.replaying.as_ref(), self.recording.as_ref());
                board.active = ActiveSource::Recording;
            }
        }
        self.replaying.stop();
        tracing::info!("switched to {} source", self.recording.kind());
        self.recording.start()
    }

    fn on_replay_finished(&self) {
        let _switch = lock_unpoisoned(&self.switch);
        let active = lock_unpoisoned(&self.board).active.clone();
        if active == ActiveSource::Recording || self.replaying.is_replaying() {
            // stale: already switched back or a new replay is running
            return;
        }
        if let Err(e) = self.activate_recording() {
            tracing::error!("live source did not restart after replay: {}", e);
        }
    }
}
