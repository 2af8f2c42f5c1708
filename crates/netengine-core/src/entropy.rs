//! Entropy source: a handle on the system randomness device.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Lifecycle contract for the entropy source.
pub trait EntropySource {
    /// Path of the device backing this source.
    fn device(&self) -> &Path;

    /// Fill `buf` entirely with bytes from the device.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Close the device handle.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Entropy read from a character device such as `/dev/urandom`.
#[derive(Debug)]
pub struct DeviceEntropy {
    path: PathBuf,
    file: File,
}

impl DeviceEntropy {
    /// Open `path` read-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        debug!(device = %path.display(), "entropy source opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl EntropySource for DeviceEntropy {
    fn device(&self) -> &Path {
        &self.path
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let Self { path, file } = *self;
        drop(file);
        debug!(device = %path.display(), "entropy source closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_missing_device_fails() {
        let err = DeviceEntropy::open(Path::new("/nonexistent/urandom")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fill_reads_from_device() {
        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut source = DeviceEntropy::open(tmp.path()).unwrap();
        assert_eq!(source.device(), tmp.path());

        let mut buf = [0u8; 4];
        source.fill(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        // Short reads surface as errors rather than partially filled buffers.
        let err = source.fill(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        Box::new(source).close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_urandom_fills_buffer() {
        let mut source = DeviceEntropy::open(Path::new("/dev/urandom")).unwrap();
        let mut buf = [0u8; 64];
        source.fill(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
    }
}
