use std::{
    collections::BTreeMap,
    ops::Range,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use bytes::Bytes;

use super::{BufferPool, StorageError};

/// Keeps every object in memory; used by tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryBufferPool {
    objects: RwLock<BTreeMap<PathBuf, Bytes>>,
}

impl MemoryBufferPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferPool for MemoryBufferPool {
    fn get_object(&self, path: &Path) -> Result<Bytes, StorageError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn object_size(&self, path: &Path) -> Result<u64, StorageError> {
        Ok(self.get_object(path)?.len() as u64)
    }

    fn get_range(&self, path: &Path, range: Range<u64>) -> Result<Bytes, StorageError> {
        let data = self.get_object(path)?;
        let size = data.len() as u64;
        if range.start > range.end || range.end > size {
            return Err(StorageError::OutOfBounds {
                path: path.to_path_buf(),
                range,
                size,
            });
        }
        Ok(data.slice(range.start as usize..range.end as usize))
    }

    fn put_object(&self, path: &Path, data: Bytes) -> Result<(), StorageError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(path.to_path_buf(), data);
        Ok(())
    }

    fn list_objects(&self, dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect())
    }

    fn delete_object(&self, path: &Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_objects_below_directory() {
        let pool = MemoryBufferPool::new();
        pool.put_object(Path::new("tables/a/data/x"), Bytes::from_static(b"1"))
            .expect("put");
        pool.put_object(Path::new("tables/a/meta/x"), Bytes::from_static(b"2"))
            .expect("put");
        pool.put_object(Path::new("tables/ab/data/y"), Bytes::from_static(b"3"))
            .expect("put");

        assert_eq!(
            pool.list_objects(Path::new("tables/a")).expect("list"),
            vec![
                PathBuf::from("tables/a/data/x"),
                PathBuf::from("tables/a/meta/x")
            ]
        );
        assert_eq!(
            pool.get_object(Path::new("tables/ab/data/y")).expect("get"),
            Bytes::from_static(b"3")
        );

        let path = Path::new("tables/a/data/x");
        pool.put_object(path, Bytes::from_static(b"parquet")).expect("put");
        assert_eq!(pool.object_size(path).expect("size"), 7);
        assert_eq!(
            pool.get_range(path, 2..5).expect("range"),
            Bytes::from_static(b"rqu")
        );
        assert!(matches!(
            pool.get_range(path, 5..8),
            Err(StorageError::OutOfBounds { size: 7, .. })
        ));

        pool.delete_object(Path::new("tables/ab/data/y")).expect("delete");
        assert!(matches!(
            pool.get_object(Path::new("tables/ab/data/y")),
            Err(StorageError::NotFound(_))
        ));
    }
}
