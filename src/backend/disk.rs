use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use parking_lot::RwLock;
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use super::{BlockStore, PROBE_PAYLOAD, clamp_range, probe_block_id};
use crate::error::{Error, Result};
use crate::model::{BlockId, Version};

/// Block store on the local filesystem.
///
/// Blocks live at `<root>/<id[0..2]>/<id[2..4]>/<id>`. Writes go to a
/// temporary sibling file which is then renamed into place, so a reader
/// never observes a partially written block.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    inner: Arc<DiskInner>,
}

#[derive(Debug)]
struct DiskInner {
    id: String,
    root: Utf8PathBuf,
    /// Writers are exclusive; readers only exclude writers.
    lock: RwLock<()>,
}

impl DiskBackend {
    pub fn open(id: impl Into<String>, root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskBackend {
            inner: Arc::new(DiskInner {
                id: id.into(),
                root,
                lock: RwLock::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    pub fn block_path(&self, block_id: &BlockId) -> Utf8PathBuf {
        let (dir1, dir2) = block_id.shard();
        self.inner.root.join(dir1).join(dir2).join(block_id.as_str())
    }

    pub fn write(&self, block_id: &BlockId, data: &[u8]) -> Result<()> {
        let _guard = self.inner.lock.write();
        let path = self.block_path(block_id);
        let dir = path.parent().unwrap_or(self.inner.root.as_path());
        fs::create_dir_all(dir)?;

        // Dropping the temp file on any failure below removes it.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(%block_id, size = data.len(), "wrote block to {path}");
        Ok(())
    }

    pub fn read(&self, block_id: &BlockId, offset: u64, length: u64) -> Result<Bytes> {
        let _guard = self.inner.lock.read();
        let path = self.block_path(block_id);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::BlockNotFound(block_id.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let size = file.metadata()?.len();
        let range = clamp_range(size, offset, length)?;
        let span = usize::try_from(range.end - range.start)
            .map_err(|_| io::Error::from(io::ErrorKind::FileTooLarge))?;

        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; span];
        file.read_exact(&mut buf)?;
        trace!(%block_id, offset, len = span, "read block range");
        Ok(Bytes::from(buf))
    }

    pub fn delete(&self, block_id: &BlockId) -> Result<()> {
        let _guard = self.inner.lock.write();
        match fs::remove_file(self.block_path(block_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlockNotFound(block_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn exists(&self, block_id: &BlockId) -> Result<bool> {
        let _guard = self.inner.lock.read();
        match fs::metadata(self.block_path(block_id)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// All block IDs under the sharded tree. Leftover temporary files are not
    /// valid IDs and are skipped.
    pub fn list(&self) -> Result<Vec<BlockId>> {
        let _guard = self.inner.lock.read();
        let ids = WalkDir::new(&self.inner.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_ok(|entry| entry.file_type().is_file())
            .filter_map_ok(|entry| BlockId::parse(entry.file_name().to_str()?).ok())
            .collect::<std::result::Result<Vec<_>, walkdir::Error>>()
            .map_err(io::Error::from)?;
        Ok(ids)
    }

    #[instrument(skip_all, fields(root = %self.inner.root))]
    pub fn probe(&self) -> Result<()> {
        let probe = probe_block_id()?;
        self.write(&probe, PROBE_PAYLOAD)?;

        let outcome = (|| -> Result<()> {
            if self.read(&probe, 0, 0)? != PROBE_PAYLOAD {
                return Err(Error::Config(format!(
                    "disk probe at {} read back different data",
                    self.block_path(&probe)
                )));
            }
            if !self.list()?.contains(&probe) {
                return Err(Error::Config("disk probe block missing from listing".into()));
            }
            Ok(())
        })();

        self.delete(&probe)?;
        if self.exists(&probe)? {
            return Err(Error::Config("disk probe block still present after delete".into()));
        }
        outcome?;
        debug!("disk access probe passed");
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DiskBackend) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|err| Error::Io(io::Error::other(err)))?
    }
}

#[async_trait]
impl BlockStore for DiskBackend {
    fn store_type(&self) -> &'static str {
        "disk"
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn write_block(
        &self,
        block_id: &BlockId,
        payload: Bytes,
        version: Version,
    ) -> Result<()> {
        trace!(%block_id, %version, "disk write commits synchronously");
        let block_id = block_id.clone();
        self.blocking(move |disk| disk.write(&block_id, &payload))
            .await
    }

    async fn read_block(
        &self,
        _location: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let block_id = block_id.clone();
        self.blocking(move |disk| disk.read(&block_id, offset, length))
            .await
    }

    async fn delete_block(&self, block_id: &BlockId) -> Result<()> {
        let block_id = block_id.clone();
        self.blocking(move |disk| disk.delete(&block_id)).await
    }

    async fn block_exists(&self, block_id: &BlockId) -> Result<bool> {
        let block_id = block_id.clone();
        self.blocking(move |disk| disk.exists(&block_id)).await
    }

    async fn list_blocks(&self) -> Result<Vec<BlockId>> {
        self.blocking(|disk| disk.list()).await
    }

    fn location(&self, block_id: &BlockId) -> String {
        self.block_path(block_id).into_string()
    }

    async fn verify_access(&self) -> Result<()> {
        self.blocking(|disk| disk.probe()).await
    }
}
