//! Output backend contract and the file-system implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use sysinfo::Disks;
use tracing::{debug, trace};

/// A writable view of the target file owned by one block.
pub trait OutputHandle: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Pushes buffered bytes to the OS and waits until they are on disk.
    fn flush_and_sync(&mut self) -> io::Result<()>;

    /// Moves the write position. Only called when the backend supports seeking.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    /// Best-effort resize of the underlying file.
    fn set_length(&mut self, len: u64) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Creates output handles for target paths.
pub trait OutputBackend: Send + Sync {
    /// Opens `path` for writing without truncating it.
    fn create(&self, path: &Path, buffer_size: usize) -> io::Result<Box<dyn OutputHandle>>;

    /// Whether handles can write at arbitrary offsets. Multi-block layouts require it.
    fn supports_seek(&self) -> bool {
        true
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Current size of `path`, 0 when missing.
    fn existing_length(&self, path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Free bytes on the volume holding `path`, `None` when unknown.
    fn available_space(&self, path: &Path) -> Option<u64> {
        available_space_for_path(path)
    }
}

/// Free space of the disk with the longest mount point containing `path`.
pub fn available_space_for_path(path: &Path) -> Option<u64> {
    let anchor = path
        .ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf());

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| anchor.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            trace!(
                mount = %disk.mount_point().display(),
                available = disk.available_space(),
                "Resolved disk for path"
            );
            disk.available_space()
        })
}

/// Writes straight to the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileOutputBackend;

impl FileOutputBackend {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for FileOutputBackend {
    fn create(&self, path: &Path, buffer_size: usize) -> io::Result<Box<dyn OutputHandle>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        debug!(path = %path.display(), buffer_size, "Opened output file");
        Ok(Box::new(FileOutputHandle {
            writer: BufWriter::with_capacity(buffer_size.max(1), file),
        }))
    }
}

struct FileOutputHandle {
    writer: BufWriter<File>,
}

impl OutputHandle for FileOutputHandle {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf)
    }

    fn flush_and_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        // BufWriter flushes before seeking.
        self.writer.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blocks_write_at_their_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("out.bin");
        let backend = FileOutputBackend::new();

        let mut first = backend.create(&path, 4).unwrap();
        let mut second = backend.create(&path, 4).unwrap();
        first.set_length(8).unwrap();
        second.seek(4).unwrap();
        second.write_all(b"5678").unwrap();
        first.write_all(b"1234").unwrap();
        first.flush_and_sync().unwrap();
        second.flush_and_sync().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"12345678");
        assert_eq!(backend.existing_length(&path), 8);
    }

    #[test]
    fn test_create_does_not_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep.bin");
        fs::write(&path, b"abcdef").unwrap();

        let mut handle = FileOutputBackend.create(&path, 16).unwrap();
        handle.seek(3).unwrap();
        handle.write_all(b"X").unwrap();
        handle.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"abcXef");
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let backend = FileOutputBackend;
        assert!(backend.delete(&dir.path().join("missing")).is_ok());
        assert!(!backend.exists(&dir.path().join("missing")));
    }

    #[test]
    fn test_available_space_for_temp_dir() {
        let dir = TempDir::new().unwrap();
        // Containers may hide mount information; only check consistency when known.
        if let Some(space) = available_space_for_path(&dir.path().join("file")) {
            assert!(space > 0);
        }
    }
}
