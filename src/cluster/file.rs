//! Membership directory backed by a shared JSON file
//!
//! Every query re-reads the file, so waits observe registrations that other
//! nodes write while this node polls. Writes are read-modify-write cycles
//! under a sibling `.lock` file and land through an atomic rename.

use super::local::{LocalDirectory, MembershipFile};
use super::{MembershipDirectory, Node, NodeFilter, ServiceRegistration};
use crate::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Directory over a membership file shared by every node of the cluster
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    /// Serializes writers inside this process; the lock file covers the rest
    writer: Mutex<()>,
}

impl FileDirectory {
    /// Open the file and check that it parses and validates.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let membership = MembershipFile::read(&path).await?;
        info!(
            path = %path.display(),
            nodes = membership.nodes.len(),
            services = membership.services.len(),
            "Opened shared membership file"
        );
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn current(&self) -> Result<LocalDirectory> {
        Ok(LocalDirectory::from_membership(
            MembershipFile::read(&self.path).await?,
        ))
    }

    /// Apply one mutation to the latest file contents and write them back.
    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&LocalDirectory) -> Result<()>,
    {
        let _writer = self.writer.lock().await;
        let lock = LockFile::acquire(&self.path).await?;

        let result = match self.current().await {
            Ok(current) => match apply(&current) {
                Ok(()) => self.store(current.snapshot()).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        lock.release().await;
        result
    }

    async fn store(&self, membership: MembershipFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&membership)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut staged = tempfile::NamedTempFile::new_in(dir)?;
            staged.write_all(&bytes)?;
            staged.as_file().sync_all()?;
            staged.persist(&path).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Directory(format!("membership write task failed: {e}")))??;
        debug!(path = %self.path.display(), "Wrote membership file");
        Ok(())
    }
}

#[async_trait]
impl MembershipDirectory for FileDirectory {
    async fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        self.current().await?.find_nodes(filter).await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.current().await?.get_node(name).await
    }

    async fn register_address(&self, node: &str, address: &str) -> Result<()> {
        self.update(|current| current.set_registered_address(node, address))
            .await
    }

    async fn provide_service(&self, registration: ServiceRegistration) -> Result<()> {
        self.update(move |current| {
            current.insert_registration(registration);
            Ok(())
        })
        .await
    }

    async fn find_providers(&self, service: &str) -> Result<Vec<ServiceRegistration>> {
        self.current().await?.find_providers(service).await
    }

    async fn register_facet_identity(&self, facet: &str, address: &str) -> Result<()> {
        self.update(|current| {
            current.set_facet_identity(facet, address);
            Ok(())
        })
        .await
    }

    async fn facet_identity(&self, facet: &str) -> Result<Option<String>> {
        self.current().await?.facet_identity(facet).await
    }
}

/// Exclusive `<file>.lock` marker, created with `create_new`
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(target: &Path) -> Result<Self> {
        let mut name = OsString::from(target.as_os_str());
        name.push(".lock");
        let path = PathBuf::from(name);

        for _ in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Directory(format!(
            "lock {} is still held after {} attempts",
            path.display(),
            LOCK_ATTEMPTS
        )))
    }

    async fn release(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(lock = %self.path.display(), error = %e, "Failed to release membership lock");
        }
    }
}
