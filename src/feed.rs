//! Hardware feed contract and a simulated feed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::FeedConfig;
use crate::error::SourceError;
use crate::utils::lock_unpoisoned;

/// One raw update from the sensors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    pub location: Option<(f64, f64)>,
}

impl RawReading {
    pub fn new(heading: f32, pitch: f32, roll: f32) -> Self {
        Self { heading, pitch, roll, location: None }
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some((latitude, longitude));
        self
    }

    pub fn is_valid(&self) -> bool {
        let location_ok = self
            .location
            .map_or(true, |(lat, lon)| lat.is_finite() && lon.is_finite());
        self.heading.is_finite() && self.pitch.is_finite() && self.roll.is_finite() && location_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Reading(RawReading),
    /// Transient read failure; consumers keep their last value
    Fault(String),
}

pub type FeedCallback = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// Push-based sensor feed. At most one subscriber at a time.
pub trait HardwareFeed: Send + Sync {
    fn subscribe(&self, callback: FeedCallback) -> Result<(), SourceError>;

    fn unsubscribe(&self);
}

/// Feed driven by test code or by a generator task
pub struct SimulatedFeed {
    callback: Mutex<Option<FeedCallback>>,
    available: AtomicBool,
    subscriptions: AtomicUsize,
}

impl Default for SimulatedFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFeed {
    pub fn new() -> Self {
        SimulatedFeed {
            callback: Mutex::new(None),
            available: AtomicBool::new(true),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        lock_unpoisoned(&self.callback).is_some()
    }

    /// Number of successful `subscribe` calls so far
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Deliver an event on the calling thread. Returns false with no subscriber.
    pub fn emit(&self, event: FeedEvent) -> bool {
        let callback = lock_unpoisoned(&self.callback).clone();
        match callback {
            Some(cb) => {
                cb(event);
                true
            }
            None => false,
        }
    }

    pub fn push(&self, reading: RawReading) -> bool {
        self.emit(FeedEvent::Reading(reading))
    }

    pub fn fault(&self, reason: &str) -> bool {
        self.emit(FeedEvent::Fault(reason.to_string()))
    }

    /// Generate a slowly turning heading with a little pitch/roll jitter
    pub fn spawn_generator(self: &Arc<Self>, cfg: &FeedConfig) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(cfg.sample_interval_ms.max(1));
            let step = cfg.heading_rate_dps * period.as_secs_f32();
            let mut interval = tokio::time::interval(period);
            let mut heading = 0.0f32;
            let mut emitted = 0u64;

            tracing::info!("simulated feed running every {}ms", period.as_millis());
            loop {
                interval.tick().await;
                heading = (heading + step).rem_euclid(360.0);
                let pitch = (rand::random::<f32>() - 0.5) * 4.0;
                let roll = (rand::random::<f32>() - 0.5) * 4.0;
                let mut reading = RawReading::new(heading, pitch, roll);
                if let (Some(lat), Some(lon)) = (cfg.latitude, cfg.longitude) {
                    let jitter = (rand::random::<f64>() - 0.5) * 1e-5;
                    reading = reading.with_location(lat + jitter, lon + jitter);
                }
                if feed.push(reading) {
                    emitted += 1;
                    if emitted % 100 == 0 {
                        tracing::debug!("simulated feed: {} readings delivered", emitted);
                    }
                }
            }
        })
    }
}

impl HardwareFeed for SimulatedFeed {
    fn subscribe(&self, callback: FeedCallback) -> Result<(), SourceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SourceError::HardwareUnavailable("simulated feed is offline".to_string()));
        }
        *lock_unpoisoned(&self.callback) = Some(callback);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unsubscribe(&self) {
        lock_unpoisoned(&self.callback).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_reaches_subscriber_only() {
        let feed = SimulatedFeed::new();
        assert!(!feed.push(RawReading::new(1.0, 0.0, 0.0)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feed.subscribe(Arc::new(move |ev| sink.lock().unwrap().push(ev))).unwrap();
        assert!(feed.push(RawReading::new(1.0, 0.0, 0.0)));
        assert!(feed.fault("magnetometer glitch"));

        feed.unsubscribe();
        assert!(!feed.push(RawReading::new(2.0, 0.0, 0.0)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], FeedEvent::Fault("magnetometer glitch".to_string()));
    }

    #[test]
    fn test_offline_feed_refuses_subscription() {
        let feed = SimulatedFeed::new();
        feed.set_available(false);
        let result = feed.subscribe(Arc::new(|_| {}));
        assert!(matches!(result, Err(SourceError::HardwareUnavailable(_))));
        assert!(!feed.is_subscribed());
        assert_eq!(feed.subscription_count(), 0);
    }

    #[test]
    fn test_reading_validation() {
        assert!(RawReading::new(10.0, 1.0, 1.0).with_location(1.0, 2.0).is_valid());
        assert!(!RawReading::new(f32::NAN, 1.0, 1.0).is_valid());
        assert!(!RawReading::new(1.0, f32::INFINITY, 1.0).is_valid());
        assert!(!RawReading::new(1.0, 1.0, 1.0).with_location(f64::NAN, 0.0).is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_emits_turning_heading() {
        let feed = Arc::new(SimulatedFeed::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feed.subscribe(Arc::new(move |ev| {
            if let FeedEvent::Reading(r) = ev {
                sink.lock().unwrap().push(r);
            }
        }))
        .unwrap();

        let cfg = FeedConfig {
            sample_interval_ms: 100,
            heading_rate_dps: 10.0,
            latitude: Some(47.0),
            longitude: Some(19.0),
        };
        let handle = feed.spawn_generator(&cfg);
        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.abort();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 4);
        assert!(seen.windows(2).all(|w| w[1].heading > w[0].heading));
        assert!(seen.iter().all(|r| r.location.is_some() && r.is_valid()));
    }
}
