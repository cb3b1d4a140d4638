use crate::codec::{self, SampleReader, HEADER_SIZE, RECORD_SIZE};
use crate::config::StorageConfig;
use crate::error::SourceError;
use crate::source::OrientationSample;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File extension of orientation logs
pub const LOG_EXTENSION: &str = "orl";

/// Directory holding one log file per recording session
#[derive(Clone, Debug)]
pub struct LogStore {
    pub root: Arc<PathBuf>,
    sync_on_close: bool,
}

/// Listing entry for a stored log
#[derive(Debug, Clone, Serialize)]
pub struct LogInfo {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sample_count: u64,
    pub duration_ms: u32,
}

/// Every readable sample of a log, plus where it was cut short
#[derive(Debug)]
pub struct LogContents {
    pub samples: Vec<OrientationSample>,
    pub truncated: Option<SourceError>,
}

impl LogContents {
    pub fn duration_ms(&self) -> u32 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.offset_millis - first.offset_millis,
            _ => 0,
        }
    }
}

impl LogStore {
    /// A directory that cannot be created here is only logged; the failure
    /// surfaces when a recording is started.
    pub fn new(cfg: &StorageConfig) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cfg.path) {
            tracing::warn!("cannot create log directory {}: {}", cfg.path.display(), e);
        }
        LogStore { root: Arc::new(cfg.path.clone()), sync_on_close: cfg.sync_on_close }
    }

    pub fn sync_on_close(&self) -> bool {
        self.sync_on_close
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf, SourceError> {
        validate_id(id)?;
        Ok(self.root.join(format!("{}.{}", id, LOG_EXTENSION)))
    }

    /// Path of an existing log, or `FileNotFound`
    pub fn resolve(&self, id: &str) -> Result<PathBuf, SourceError> {
        let path = self.path_for(id)?;
        if !path.is_file() {
            return Err(SourceError::not_found(path, "no such log"));
        }
        Ok(path)
    }

    /// Create the log for a new session. Existing logs are never reused.
    pub fn create_log(&self, id: &str) -> Result<LogWriter, SourceError> {
        let path = self.path_for(id)?;
        std::fs::create_dir_all(&*self.root).map_err(|e| SourceError::storage(&*self.root, e))?;
        match LogWriter::create(&path, self.sync_on_close) {
            Err(SourceError::StorageUnavailable { source, .. })
                if source.kind() == io::ErrorKind::AlreadyExists =>
            {
                Err(SourceError::LogExists(id.to_string()))
            }
            other => other,
        }
    }

    /// `orientation-<unix millis>`, bumped until it names no existing log
    pub fn generate_id(&self) -> String {
        let base = format!("orientation-{}", crate::utils::unix_time_ms());
        let mut id = base.clone();
        let mut n = 1;
        while self.root.join(format!("{}.{}", id, LOG_EXTENSION)).exists() {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }

    pub async fn list_logs(&self) -> Result<Vec<LogInfo>, SourceError> {
        let mut entries = tokio::fs::read_dir(&*self.root).await?;
        let mut out = Vec::new();
        while let Some(ent) = entries.next_entry().await? {
            let p = ent.path();
            if p.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(id) = p.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let data = tokio::fs::read(&p).await?;
            let size_bytes = data.len() as u64;
            let sample_count = size_bytes.saturating_sub(HEADER_SIZE as u64) / RECORD_SIZE as u64;
            let duration_ms = span_of(&data);
            out.push(LogInfo { id, path: p, size_bytes, sample_count, duration_ms });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn log_checksum(path: &Path) -> Result<String, SourceError> {
        let data = tokio::fs::read(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Read a whole log, truncating at the first corrupt record
    pub fn read_log(path: &Path) -> Result<LogContents, SourceError> {
        let mut reader = open_reader(path)?;
        let mut samples = Vec::new();
        let truncated = loop {
            match reader.next_sample() {
                Ok(Some(s)) => samples.push(s),
                Ok(None) => break None,
                Err(e @ SourceError::CorruptRecord(_)) => {
                    tracing::warn!(
                        "log {} truncated after {} records: {}",
                        path.display(),
                        samples.len(),
                        e
                    );
                    break Some(e);
                }
                Err(e) => return Err(e),
            }
        };
        Ok(LogContents { samples, truncated })
    }
}

/// Open a log for replay. Missing files and bad headers are `FileNotFound`.
pub fn open_reader(path: &Path) -> Result<SampleReader<BufReader<File>>, SourceError> {
    let file = File::open(path).map_err(|e| SourceError::not_found(path, e.to_string()))?;
    match SampleReader::open(BufReader::new(file)) {
        Ok(reader) => Ok(reader),
        Err(SourceError::CorruptRecord(e)) => {
            Err(SourceError::not_found(path, format!("not a valid log: {}", e)))
        }
        Err(e) => Err(e),
    }
}

// Offset of the last whole record minus the first; 0 when either is unreadable
fn span_of(data: &[u8]) -> u32 {
    let records = data.len().saturating_sub(HEADER_SIZE) / RECORD_SIZE;
    if records == 0 {
        return 0;
    }
    let at = |i: usize| codec::decode(&data[HEADER_SIZE + i * RECORD_SIZE..HEADER_SIZE + (i + 1) * RECORD_SIZE]);
    match (at(0), at(records - 1)) {
        (Ok(first), Ok(last)) => last.offset_millis.saturating_sub(first.offset_millis),
        _ => 0,
    }
}

fn validate_id(id: &str) -> Result<(), SourceError> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains("..")
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control);
    if bad {
        return Err(SourceError::InvalidLogId(id.to_string()));
    }
    Ok(())
}

/// Buffered append handle on one log file
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    sync_on_close: bool,
    samples: u64,
}

impl LogWriter {
    /// Create a fresh log and write its header
    pub fn create(path: &Path, sync_on_close: bool) -> Result<Self, SourceError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| SourceError::storage(path, e))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&codec::encode_header()).map_err(|e| SourceError::storage(path, e))?;
        writer.flush().map_err(|e| SourceError::storage(path, e))?;
        Ok(LogWriter { path: path.to_path_buf(), writer, sync_on_close, samples: 0 })
    }

    /// Reopen an existing log in append mode after its handle was closed
    pub fn reopen(path: &Path, sync_on_close: bool) -> Result<Self, SourceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| SourceError::storage(path, e))?;
        let len = file.metadata().map_err(|e| SourceError::storage(path, e))?.len();
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| SourceError::storage(path, e))?;
        codec::decode_header(&header)?;
        let samples = len.saturating_sub(HEADER_SIZE as u64) / RECORD_SIZE as u64;
        Ok(LogWriter { path: path.to_path_buf(), writer: BufWriter::new(file), sync_on_close, samples })
    }

    /// Unbuffered writer over an already open handle
    #[cfg(test)]
    pub(crate) fn unbuffered(path: &Path, file: File) -> Self {
        LogWriter { path: path.to_path_buf(), writer: BufWriter::with_capacity(0, file), sync_on_close: false, samples: 0 }
    }

    pub fn append(&mut self, sample: &OrientationSample) -> Result<(), SourceError> {
        self.writer
            .write_all(&codec::encode(sample))
            .map_err(|e| SourceError::storage(&self.path, e))?;
        self.samples += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Flush buffered records and release the handle
    pub fn close(mut self) -> Result<u64, SourceError> {
        self.writer.flush().map_err(|e| SourceError::storage(&self.path, e))?;
        if self.sync_on_close {
            self.writer.get_ref().sync_all().map_err(|e| SourceError::storage(&self.path, e))?;
        }
        Ok(self.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use std::fs;
    use tempfile::TempDir;

    fn store(tmpdir: &TempDir) -> LogStore {
        LogStore::new(&StorageConfig { path: tmpdir.path().join("orientations"), sync_on_close: false })
    }

    #[test]
    fn test_write_and_read_back() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        let mut writer = store.create_log("walk")?;
        writer.append(&OrientationSample::new(0, 10.0, 1.0, 2.0))?;
        writer.append(&OrientationSample::new(40, 11.0, 1.0, 2.0).with_location(1.5, 2.5))?;
        assert_eq!(writer.close()?, 2);

        let contents = LogStore::read_log(&store.resolve("walk")?)?;
        assert!(contents.truncated.is_none());
        assert_eq!(contents.samples.len(), 2);
        assert_eq!(contents.samples[1].latitude, Some(1.5));
        assert_eq!(contents.duration_ms(), 40);

        Ok(())
    }

    #[test]
    fn test_existing_log_is_never_overwritten() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        store.create_log("walk")?.close()?;
        assert!(matches!(store.create_log("walk"), Err(SourceError::LogExists(id)) if id == "walk"));

        Ok(())
    }

    #[test]
    fn test_reopen_appends_after_existing_records() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        let mut writer = store.create_log("walk")?;
        writer.append(&OrientationSample::new(0, 10.0, 0.0, 0.0))?;
        let path = writer.path().to_path_buf();
        writer.close()?;

        let mut writer = LogWriter::reopen(&path, false)?;
        assert_eq!(writer.samples(), 1);
        writer.append(&OrientationSample::new(90, 12.0, 0.0, 0.0))?;
        writer.close()?;

        let contents = LogStore::read_log(&path)?;
        let headings: Vec<f32> = contents.samples.iter().map(|s| s.heading).collect();
        assert_eq!(headings, vec![10.0, 12.0]);

        Ok(())
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let tmpdir = TempDir::new().unwrap();
        let store = store(&tmpdir);
        for id in ["", "../escape", "a/b", "a\\b", ".hidden"] {
            assert!(matches!(store.path_for(id), Err(SourceError::InvalidLogId(_))), "{id}");
        }
        assert!(store.path_for("2024-06-01_walk").is_ok());
    }

    #[test]
    fn test_missing_and_invalid_logs_are_not_found() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        assert!(matches!(store.resolve("nope"), Err(SourceError::FileNotFound { .. })));

        let junk = store.path_for("junk")?;
        fs::write(&junk, b"definitely not a log")?;
        assert!(matches!(open_reader(&junk), Err(SourceError::FileNotFound { .. })));

        Ok(())
    }

    #[test]
    fn test_corrupt_tail_is_truncated() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        let mut writer = store.create_log("walk")?;
        for (i, h) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            writer.append(&OrientationSample::new(i as u32 * 100, h, 0.0, 0.0))?;
        }
        let path = writer.path().to_path_buf();
        writer.close()?;

        // corrupt the heading of the last record
        let mut data = fs::read(&path)?;
        let idx = HEADER_SIZE + 2 * RECORD_SIZE + 5;
        data[idx] ^= 0xFF;
        fs::write(&path, data)?;

        let contents = LogStore::read_log(&path)?;
        assert_eq!(contents.samples.len(), 2);
        assert!(matches!(
            contents.truncated,
            Some(SourceError::CorruptRecord(CodecError::ChecksumMismatch { .. }))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_list_logs_and_checksum() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        let mut a = store.create_log("a")?;
        a.append(&OrientationSample::new(0, 1.0, 0.0, 0.0))?;
        a.append(&OrientationSample::new(10, 2.0, 0.0, 0.0))?;
        a.close()?;
        store.create_log("b")?.close()?;
        fs::write(store.root.join("notes.txt"), b"ignored")?;

        let logs = store.list_logs().await?;
        let summary: Vec<(String, u64)> = logs.iter().map(|l| (l.id.clone(), l.sample_count)).collect();
        assert_eq!(summary, vec![("a".to_string(), 2), ("b".to_string(), 0)]);
        assert_eq!(logs[0].duration_ms, 10);
        assert_eq!(logs[1].duration_ms, 0);

        let c1 = LogStore::log_checksum(&logs[0].path).await?;
        let c2 = LogStore::log_checksum(&logs[0].path).await?;
        assert_eq!(c1, c2);
        assert_ne!(c1, LogStore::log_checksum(&logs[1].path).await?);

        Ok(())
    }

    #[test]
    fn test_generated_ids_do_not_collide() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let store = store(&tmpdir);

        let first = store.generate_id();
        store.create_log(&first)?.close()?;
        let second = store.generate_id();
        assert_ne!(first, second);
        assert!(second.starts_with("orientation-"));

        Ok(())
    }
}
