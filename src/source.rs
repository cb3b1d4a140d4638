//! The orientation source contract shared by live and replayed providers.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::listeners::OrientationListener;

/// Heading, pitch and roll in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// One timestamped reading as stored in an orientation log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrientationSample {
    /// Milliseconds since the session started
    pub offset_millis: u32,
    /// Degrees, 0-360
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl OrientationSample {
    pub fn new(offset_millis: u32, heading: f32, pitch: f32, roll: f32) -> Self {
        Self {
            offset_millis,
            heading,
            pitch,
            roll,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn orientation(&self) -> Orientation {
        Orientation {
            heading: self.heading,
            pitch: self.pitch,
            roll: self.roll,
        }
    }
}

/// Which provider a source is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Recording,
    Replaying,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Recording => write!(f, "recording"),
            SourceKind::Replaying => write!(f, "replaying"),
        }
    }
}

/// Capability set every orientation provider implements.
///
/// `start` and `stop` are idempotent. After `stop` the getters keep returning
/// the last known values.
pub trait OrientationSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn start(&self) -> Result<(), SourceError>;

    /// Returns once no further notification can be delivered.
    fn stop(&self);

    fn is_started(&self) -> bool;

    fn heading(&self) -> f32 {
        self.orientation().heading
    }

    fn orientation(&self) -> Orientation;

    /// Registration is by identity; the source only keeps a weak reference.
    fn add_listener(&self, listener: &Arc<dyn OrientationListener>);

    fn remove_listener(&self, listener: &Arc<dyn OrientationListener>);
}

/// Summary of a closed recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub id: String,
    pub path: std::path::PathBuf,
    pub samples: u64,
}

/// Disk-write toggle of a live source. Independent of `start`/`stop`.
pub trait RecordControl: OrientationSource {
    fn start_recording(&self, id: &str) -> Result<(), SourceError>;

    fn stop_recording(&self) -> Result<Option<RecordingSummary>, SourceError>;

    fn is_recording(&self) -> bool;
}

/// File selection of a replaying source.
pub trait ReplayControl: OrientationSource {
    fn set_file(&self, path: &Path) -> Result<(), SourceError>;

    fn is_replaying(&self) -> bool;
}
