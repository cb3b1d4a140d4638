//! Live orientation source that can also record to disk.
//!
//! `start`/`stop` control the hardware subscription; `start_recording`/
//! `stop_recording` only toggle whether forwarded samples are also written to
//! a log. A failing disk never interrupts live forwarding.

use crate::error::SourceError;
use crate::feed::{FeedEvent, HardwareFeed, RawReading};
use crate::listeners::{notify_error, notify_sample, DeliveryGate, ListenerSet, OrientationListener};
use crate::source::{
    Orientation, OrientationSample, OrientationSource, RecordControl, RecordingSummary, SourceKind,
};
use crate::storage::{LogStore, LogWriter};
use crate::utils::{lock_unpoisoned, saturating_millis};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// One log being written
struct RecordingSession {
    id: String,
    path: PathBuf,
    anchor: Instant,
    /// Open only while the source is started
    writer: Option<LogWriter>,
    samples: u64,
}

impl RecordingSession {
    fn close_writer(&mut self) -> Result<(), SourceError> {
        match self.writer.take() {
            Some(writer) => writer.close().map(|_| ()),
            None => Ok(()),
        }
    }
}

struct RecorderState {
    started: bool,
    started_at: Instant,
    current: Orientation,
    location: Option<(f64, f64)>,
    session: Option<RecordingSession>,
}

struct RecorderShared {
    feed: Arc<dyn HardwareFeed>,
    store: LogStore,
    state: Mutex<RecorderState>,
    // serialises start/stop so the feed is never subscribed twice
    lifecycle: Mutex<()>,
    listeners: ListenerSet,
    gate: DeliveryGate,
    samples_forwarded: AtomicU64,
}

/// Live source wrapping a hardware feed
pub struct RecordingSource {
    shared: Arc<RecorderShared>,
}

impl RecordingSource {
    pub fn new(feed: Arc<dyn HardwareFeed>, store: LogStore) -> Self {
        RecordingSource {
            shared: Arc::new(RecorderShared {
                feed,
                store,
                state: Mutex::new(RecorderState {
                    started: false,
                    started_at: Instant::now(),
                    current: Orientation::default(),
                    location: None,
                    session: None,
                }),
                lifecycle: Mutex::new(()),
                listeners: ListenerSet::new(),
                gate: DeliveryGate::new(),
                samples_forwarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.shared.store
    }

    /// Identifier of the log currently being written
    pub fn current_log_id(&self) -> Option<String> {
        lock_unpoisoned(&self.shared.state).session.as_ref().map(|s| s.id.clone())
    }

    pub fn last_location(&self) -> Option<(f64, f64)> {
        lock_unpoisoned(&self.shared.state).location
    }

    pub fn samples_forwarded(&self) -> u64 {
        self.shared.samples_forwarded.load(Ordering::Relaxed)
    }
}

impl RecorderShared {
    fn on_feed_event(&self, event: FeedEvent) {
        let reading = match event {
            FeedEvent::Reading(r) if r.is_valid() => r,
            FeedEvent::Reading(r) => {
                tracing::debug!("dropping invalid reading {:?}", r);
                return;
            }
            FeedEvent::Fault(reason) => {
                tracing::debug!("hardware read fault ignored: {}", reason);
                return;
            }
        };

        self.gate.deliver(|| {
            let Some((sample, write_error)) = self.accept(reading) else {
                return;
            };
            let listeners = self.listeners.snapshot();
            notify_sample(&listeners, &sample);
            if let Some(err) = write_error {
                notify_error(&listeners, &err);
            }
        });
    }

    /// Update state and append to the log. `None` when stopped.
    fn accept(&self, reading: RawReading) -> Option<(OrientationSample, Option<SourceError>)> {
        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;
        if !state.started {
            return None;
        }

        let heading = reading.heading.rem_euclid(360.0);
        state.current = Orientation { heading, pitch: reading.pitch, roll: reading.roll };
        if reading.location.is_some() {
            state.location = reading.location;
        }

        let anchor = state.session.as_ref().map_or(state.started_at, |s| s.anchor);
        let mut sample = OrientationSample::new(
            saturating_millis(anchor.elapsed()),
            heading,
            reading.pitch,
            reading.roll,
        );
        if let Some((lat, lon)) = state.location {
            sample = sample.with_location(lat, lon);
        }

        let mut write_error = None;
        if let Some(session) = state.session.as_mut() {
            if let Some(writer) = session.writer.as_mut() {
                match writer.append(&sample) {
                    Ok(()) => session.samples += 1,
                    Err(e) => write_error = Some(e),
                }
            }
        }
        if let Some(e) = &write_error {
            // the handle is broken, drop it without a flush
            if let Some(session) = state.session.take() {
                tracing::error!("recording to {} failed, recording disabled: {}", session.path.display(), e);
            }
        }

        self.samples_forwarded.fetch_add(1, Ordering::Relaxed);
        Some((sample, write_error))
    }

    fn report_error(&self, err: SourceError) {
        self.gate.deliver(|| notify_error(&self.listeners.snapshot(), &err));
    }
}

impl OrientationSource for RecordingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Recording
    }

    fn start(&self) -> Result<(), SourceError> {
        let _lifecycle = lock_unpoisoned(&self.shared.lifecycle);
        if lock_unpoisoned(&self.shared.state).started {
            return Ok(());
        }

        // subscribe without holding the state lock; the feed may call back at once
        let weak = Arc::downgrade(&self.shared);
        let callback = Arc::new(move |event: FeedEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_feed_event(event);
            }
        });

        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.started = true;
            state.started_at = Instant::now();
        }
        if let Err(e) = self.shared.feed.subscribe(callback) {
            tracing::warn!("hardware feed unavailable: {}", e);
            lock_unpoisoned(&self.shared.state).started = false;
            return Err(e);
        }

        let reopen_error = {
            let mut state = lock_unpoisoned(&self.shared.state);
            let sync = self.shared.store.sync_on_close();
            let result = match state.session.as_mut() {
                Some(session) if session.writer.is_none() => {
                    LogWriter::reopen(&session.path, sync).map(|writer| {
                        tracing::info!("resumed recording to {}", session.path.display());
                        session.writer = Some(writer);
                    })
                }
                _ => Ok(()),
            };
            match result {
                Ok(()) => None,
                Err(e) => {
                    if let Some(session) = state.session.take() {
                        tracing::error!("cannot reopen {}, recording disabled: {}", session.path.display(), e);
                    }
                    Some(e)
                }
            }
        };
        if let Some(e) = reopen_error {
            self.shared.report_error(e);
        }

        tracing::info!("recording source started");
        Ok(())
    }

    fn stop(&self) {
        let _lifecycle = lock_unpoisoned(&self.shared.lifecycle);
        let close_result = {
            let mut state = lock_unpoisoned(&self.shared.state);
            if !state.started {
                return;
            }
            state.started = false;
            state.session.as_mut().map(RecordingSession::close_writer)
        };
        self.shared.feed.unsubscribe();
        self.shared.gate.wait_idle();

        if let Some(Err(e)) = close_result {
            tracing::error!("closing recording failed: {}", e);
            lock_unpoisoned(&self.shared.state).session = None;
            self.shared.report_error(e);
        }
        tracing::info!("recording source stopped");
    }

    fn is_started(&self) -> bool {
        lock_unpoisoned(&self.shared.state).started
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

impl RecordControl for RecordingSource {
    /// Open a new log named `id`. A session already in progress is closed first.
    fn start_recording(&self, id: &str) -> Result<(), SourceError> {
        let writer = self.shared.store.create_log(id)?;
        let path = writer.path().to_path_buf();

        let mut state = lock_unpoisoned(&self.shared.state);
        if let Some(mut previous) = state.session.take() {
            match previous.close_writer() {
                Ok(()) => tracing::info!("closed recording {} ({} samples)", previous.id, previous.samples),
                Err(e) => tracing::error!("closing recording {} failed: {}", previous.id, e),
            }
        }

        let writer = if state.started {
            Some(writer)
        } else {
            // no handles while stopped; reopened by start()
            writer.close()?;
            None
        };
        tracing::info!("recording to {}", path.display());
        state.session = Some(RecordingSession {
            id: id.to_string(),
            path,
            anchor: Instant::now(),
            writer,
            samples: 0,
        });
        Ok(())
    }

    fn stop_recording(&self) -> Result<Option<RecordingSummary>, SourceError> {
        let session = lock_unpoisoned(&self.shared.state).session.take();
        let Some(mut session) = session else {
            return Ok(None);
        };
        session.close_writer()?;
        tracing::info!("recording {} finished with {} samples", session.id, session.samples);
        Ok(Some(RecordingSummary { id: session.id, path: session.path, samples: session.samples }))
    }

    fn is_recording(&self) -> bool {
        lock_unpoisoned(&self.shared.state).session.is_some()
    }
}

impl Drop for RecordingSource {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.stop_recording() {
            tracing::error!("closing recording on drop failed: {}", e);
        }
    }
}
