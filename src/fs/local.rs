use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use ulid::Ulid;

use super::{BufferPool, StorageError};

/// Stores objects as files under a root directory.
///
/// Writes go to a uniquely named sibling file first and are renamed into
/// place, so a crash mid-write never leaves a truncated object behind.
#[derive(Debug, Clone)]
pub struct LocalBufferPool {
    root: PathBuf,
}

impl LocalBufferPool {
    /// Open a pool rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the pool.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn not_found(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |err| match err.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
        _ => StorageError::Io(err),
    }
}

impl BufferPool for LocalBufferPool {
    fn get_object(&self, path: &Path) -> Result<Bytes, StorageError> {
        let data = fs::read(self.root.join(path)).map_err(not_found(path))?;
        Ok(Bytes::from(data))
    }

    fn object_size(&self, path: &Path) -> Result<u64, StorageError> {
        let metadata = fs::metadata(self.root.join(path)).map_err(not_found(path))?;
        Ok(metadata.len())
    }

    fn get_range(&self, path: &Path, range: Range<u64>) -> Result<Bytes, StorageError> {
        let mut file = File::open(self.root.join(path)).map_err(not_found(path))?;
        let size = file.metadata()?.len();
        if range.start > range.end || range.end > size {
            return Err(StorageError::OutOfBounds {
                path: path.to_path_buf(),
                range,
                size,
            });
        }
        let mut buf = vec![0; (range.end - range.start) as usize];
        file.seek(SeekFrom::Start(range.start))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn put_object(&self, path: &Path, data: Bytes) -> Result<(), StorageError> {
        let target = self.root.join(path);
        let dir = target
            .parent()
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))?;
        fs::create_dir_all(dir)?;

        let staging = dir.join(format!(".{}.tmp", Ulid::new()));
        fs::write(&staging, &data)?;
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }
        Ok(())
    }

    fn list_objects(&self, dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.join(dir)];
        while let Some(next) = pending.pop() {
            let entries = match fs::read_dir(&next) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                } else if !entry.file_name().to_string_lossy().starts_with('.') {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        out.push(relative.to_path_buf());
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete_object(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(self.root.join(path)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
