use std::{
    fmt::Write as _,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::fs;

use crate::errors::Result;

/// A trait for persisting per file inventory records between scans.
///
/// Records are opaque bytes, addressed by the id of the file they describe and a key naming
/// the kind of record.
///
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Fetch a record. Should return `Option::None` if there isn't one.
    ///
    async fn get(&self, file_id: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a record, replacing any previous record for the same file and key.
    ///
    async fn put(&self, file_id: &str, key: &str, bytes: &[u8]) -> Result<()>;
}

/// An `InventoryStore` that keeps one file per record in a directory.
///
pub struct DirectoryStore {
    root: PathBuf,

    /// Numbers in progress writes so no two share a file
    writes: AtomicU64,
}

impl DirectoryStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            writes: AtomicU64::new(0),
        })
    }

    /// File ids are usually paths, so escape anything that isn't safe in a file name.
    ///
    fn path_for(&self, file_id: &str, key: &str) -> PathBuf {
        self.root.join(Self::file_name(file_id, key))
    }

    fn file_name(file_id: &str, key: &str) -> String {
        let mut name = String::with_capacity(file_id.len() + key.len() + 1);
        for byte in file_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(byte as char);
            } else {
                let _ = write!(name, "%{byte:02X}");
            }
        }
        name.push('.');
        name.push_str(key);

        name
    }
}

#[async_trait]
impl InventoryStore for DirectoryStore {
    async fn get(&self, file_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(file_id, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, file_id: &str, key: &str, bytes: &[u8]) -> Result<()> {
        // Write then rename so a reader never sees a partial record
        let name = Self::file_name(file_id, key);
        let write = self.writes.fetch_add(1, Ordering::Relaxed);
        let partial = self.root.join(format!("{name}.{write}.partial"));
        fs::write(&partial, bytes).await?;
        if let Err(err) = fs::rename(&partial, self.root.join(name)).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err.into());
        }

        Ok(())
    }
}
