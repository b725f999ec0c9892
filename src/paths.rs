use crate::config::{chert_data_dir, sanitize_namespace};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

/// Lays out one device directory: the journal file plus the superblock
/// files that stand in for the metablock service.
#[derive(Debug, Clone)]
pub(crate) struct DevPathManager {
    root: PathBuf,
}

impl DevPathManager {
    pub(crate) fn default() -> Self {
        let mut root = chert_data_dir();
        if let Some(key) = thread_namespace() {
            root.push(sanitize_namespace(&key));
        } else if let Ok(key) = std::env::var("CHERT_INSTANCE_KEY") {
            root.push(sanitize_namespace(&key));
        }
        Self { root }
    }

    pub(crate) fn for_key(key: &str) -> Self {
        let mut root = chert_data_dir();
        root.push(sanitize_namespace(key));
        Self { root }
    }

    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub(crate) fn journal_path(&self, logdev_id: u32) -> PathBuf {
        self.root.join(format!("journal_{}.jrnl", logdev_id))
    }

    pub(crate) fn superblock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.sb", name))
    }

    /// Create a fresh journal file preallocated to `size` bytes. The file
    /// and its parent directory are both synced so the entry survives a
    /// crash right after format.
    pub(crate) fn create_journal_file(&self, logdev_id: u32, size: u64) -> std::io::Result<PathBuf> {
        self.ensure_root()?;
        let path = self.journal_path(logdev_id);
        let f = fs::File::create(&path)?;
        f.set_len(size)?;
        f.sync_all()?;

        // Without the directory sync the file may exist but not be visible
        // in the directory listing after a crash.
        let dir = fs::File::open(&self.root)?;
        dir.sync_all()?;

        Ok(path)
    }
}

thread_local! {
    static THREAD_NAMESPACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn set_thread_namespace(key: &str) {
    THREAD_NAMESPACE.with(|tls| {
        *tls.borrow_mut() = Some(key.to_string());
    });
}

pub(crate) fn clear_thread_namespace() {
    THREAD_NAMESPACE.with(|tls| {
        tls.borrow_mut().take();
    });
}

pub(crate) fn thread_namespace() -> Option<String> {
    THREAD_NAMESPACE.with(|tls| tls.borrow().clone())
}
