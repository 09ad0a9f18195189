//! Sample file storage.

use crate::sample::SampleMatrix;
use chrono::{DateTime, Local};
use iris_common::config::StorageConfig;
use iris_common::error::{AcqError, AcqResult};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Timestamp format shared by sample file names and job ids.
pub const COMPACT_TIMESTAMP: &str = "%Y%m%d%H%M%S";

/// `{sn}_{YYYYmmddHHMMSS}`.
pub fn stamped_name(sn: &str, at: &DateTime<Local>) -> String {
    format!("{sn}_{}", at.format(COMPACT_TIMESTAMP))
}

/// Sample file name for a cycle started at `at`.
pub fn sample_file_name(sn: &str, at: &DateTime<Local>) -> String {
    format!("{}.txt", stamped_name(sn, at))
}

/// Writes sample matrices under a base directory created on first use.
#[derive(Debug, Clone)]
pub struct SampleFileWriter {
    base_dir: PathBuf,
}

impl SampleFileWriter {
    /// Create a writer for `base_dir`. Nothing is created until the first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a writer from the storage configuration.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.base_dir.clone())
    }

    /// Base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write `matrix` to `file_name` inside the base directory.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::Storage`] if the directory or file cannot be written.
    pub fn write(&self, file_name: &str, matrix: &SampleMatrix) -> AcqResult<PathBuf> {
        fs::create_dir_all(&self.base_dir).map_err(|e| {
            AcqError::Storage(format!("cannot create {}: {e}", self.base_dir.display()))
        })?;

        let path = self.base_dir.join(file_name);
        let file = File::create(&path)
            .map_err(|e| AcqError::Storage(format!("cannot create {}: {e}", path.display())))?;
        matrix
            .write_to(BufWriter::new(file))
            .map_err(|e| AcqError::Storage(format!("cannot write {}: {e}", path.display())))?;

        debug!(path = %path.display(), rows = matrix.len(), "Sample file written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleBuffer;
    use chrono::TimeZone;

    fn matrix() -> SampleMatrix {
        let mut buffer = SampleBuffer::new();
        for channel in 1..=5 {
            buffer.store(channel, &[channel, 10, 20]);
        }
        SampleMatrix::from_buffer(&buffer).unwrap()
    }

    #[test]
    fn test_file_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(sample_file_name("1001", &at), "1001_20240309070501.txt");
        assert_eq!(stamped_name("1001", &at), "1001_20240309070501");
    }

    #[test]
    fn test_creates_directory_on_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("nested").join("samples");
        let writer = SampleFileWriter::new(&base);
        assert!(!base.exists());

        let path = writer.write("1001_x.txt", &matrix()).unwrap();
        assert!(base.is_dir());
        assert_eq!(path, base.join("1001_x.txt"));

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "1\t10\t20\n2\t10\t20\n3\t10\t20\n4\t10\t20\n5\t10\t20\n");
    }

    #[test]
    fn test_unwritable_base_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let writer = SampleFileWriter::new(blocker.join("samples"));
        assert!(matches!(
            writer.write("a.txt", &matrix()),
            Err(AcqError::Storage(_))
        ));
    }
}
