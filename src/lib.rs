//! Orientation recording and replay.
//!
//! A [`RecordingSource`] forwards live sensor orientation to listeners and can
//! log it to disk; a [`ReplayingSource`] plays a log back with the original
//! timing. The [`Switchboard`] keeps exactly one of them feeding the renderer.

pub mod codec;
pub mod compass;
pub mod config;
pub mod error;
pub mod feed;
pub mod listeners;
pub mod recorder;
pub mod replay;
pub mod source;
pub mod storage;
pub mod switchboard;
pub mod utils;

pub use error::{CodecError, SourceError};
pub use listeners::OrientationListener;
pub use recorder::RecordingSource;
pub use replay::{ReplayPhase, ReplayingSource};
pub use source::{
    Orientation, OrientationSample, OrientationSource, RecordControl, RecordingSummary, ReplayControl, SourceKind,
};
pub use storage::LogStore;
pub use switchboard::{ActiveSource, Switchboard};
