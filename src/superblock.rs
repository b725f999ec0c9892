use crate::paths::DevPathManager;
use std::fs;
use std::io;
use std::path::PathBuf;

/// File-backed store for named superblocks. Each superblock is one small
/// file replaced atomically: write to a tmp file, fsync, rename over the
/// old copy. A crash leaves either the old or the new superblock, never a
/// mix.
#[derive(Debug)]
pub(crate) struct SuperblockStore {
    paths: DevPathManager,
}

impl SuperblockStore {
    pub(crate) fn new(paths: DevPathManager) -> Self {
        Self { paths }
    }

    pub(crate) fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.paths.superblock_path(name);
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.paths.ensure_root()?;
        let path = self.paths.superblock_path(name);
        let tmp_path = tmp_path_for(&path);
        fs::write(&tmp_path, bytes)?;
        fs::File::open(&tmp_path)?.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> io::Result<()> {
        let path = self.paths.superblock_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn tmp_path_for(path: &PathBuf) -> PathBuf {
    let mut os = path.clone().into_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
