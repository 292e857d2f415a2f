//! Network namespace management
//!
//! Named network namespaces under the iproute2 `/var/run/netns/<name>`
//! convention, together with the per-namespace `/etc/netns/<name>` tree that
//! holds the faked `/etc` files bind-mounted into processes spawned inside a
//! namespace.

use nix::sched::{setns, CloneFlags};
use std::fs::{File, OpenOptions};
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Namespace '{0}' not found")]
    NotFound(String),

    #[error("Failed to create namespace: {0}")]
    Create(rtnetlink::Error),

    #[error("Failed to delete namespace: {0}")]
    Delete(rtnetlink::Error),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default content of every namespace's hosts file.
pub const DEFAULT_HOSTS: &[u8] =
    b"127.0.0.1\tlocalhost.localdomain\tlocalhost\n::1\t\tlocalhost.localdomain\tlocalhost\n\n";

const ETC_NETNS_DIR: &str = "/etc/netns";

/// A named network namespace, held open through its bind-mounted file.
#[derive(Debug)]
pub struct NetNs {
    name: String,
    file: File,
}

impl NetNs {
    /// Create a new named namespace. Fails if one with this name exists.
    pub async fn create(name: &str) -> Result<Self, NetNsError> {
        let path = Self::path(name);
        if path.exists() {
            return Err(NetNsError::AlreadyExists(name.to_string()));
        }

        debug!("Creating namespace: {}", name);
        rtnetlink::NetworkNamespace::add(name.to_string())
            .await
            .map_err(NetNsError::Create)?;

        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(NetNsError::OpenNs)?;

        info!("Created namespace: {}", name);
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Remove the namespace from the system. The held file descriptor keeps
    /// the namespace object alive until this handle is dropped.
    pub async fn delete(&self) -> Result<(), NetNsError> {
        debug!("Deleting namespace: {}", self.name);
        rtnetlink::NetworkNamespace::del(self.name.clone())
            .await
            .map_err(NetNsError::Delete)?;
        info!("Deleted namespace: {}", self.name);
        Ok(())
    }

    /// Enter the namespace on the current thread; the returned guard
    /// restores the previous namespace when dropped.
    pub fn enter(&self) -> Result<NsGuard, NetNsError> {
        // Per-thread namespace file, so the guard restores the right one on
        // a multi-threaded runtime.
        let original = OpenOptions::new()
            .read(true)
            .open("/proc/thread-self/ns/net")
            .map_err(NetNsError::OpenNs)?;

        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
        debug!("Entered namespace: {}", self.name);

        Ok(NsGuard {
            original,
            entered: self.name.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    fn path(name: &str) -> PathBuf {
        Path::new(rtnetlink::NETNS_PATH).join(name)
    }
}

/// RAII guard restoring the thread's previous network namespace.
pub struct NsGuard {
    original: File,
    entered: String,
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            warn!("Failed to restore namespace after leaving {}: {}", self.entered, e);
        } else {
            debug!("Restored original namespace after leaving {}", self.entered);
        }
    }
}

/// One hosts-file line: an address of a host plus its DNS-style aliases.
#[derive(Debug, Clone)]
pub struct HostsEntry {
    pub name: String,
    pub address: IpAddr,
    pub aliases: Vec<String>,
}

/// Create `/etc/netns/<name>` with the default hosts file and return the
/// bind-mount map (source in the root namespace, destination inside the
/// spawned process's mount namespace).
pub(crate) async fn setup_etc(name: &str) -> Result<Vec<(PathBuf, PathBuf)>, NetNsError> {
    let dir = etc_dir(name);
    fs::create_dir_all(&dir).await?;

    let hosts = dir.join("hosts");
    fs::write(&hosts, DEFAULT_HOSTS).await?;

    Ok(vec![(hosts, PathBuf::from("/etc/hosts"))])
}

/// Remove a namespace's `/etc/netns` tree. Best effort.
pub(crate) async fn remove_etc(name: &str) {
    let dir = etc_dir(name);
    if let Err(e) = fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Rewrite a hosts file: default preamble plus one line per entry.
pub(crate) async fn write_hosts(path: &Path, entries: &[HostsEntry]) -> Result<(), NetNsError> {
    let mut content = Vec::from(DEFAULT_HOSTS);
    for entry in entries {
        content.extend_from_slice(
            format!(
                "{}\t{}\t{}\n",
                entry.address,
                entry.name,
                entry.aliases.join(" ")
            )
            .as_bytes(),
        );
    }
    fs::write(path, content).await?;
    Ok(())
}

pub(crate) fn etc_dir(name: &str) -> PathBuf {
    Path::new(ETC_NETNS_DIR).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hosts_file_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        let entries = vec![
            HostsEntry {
                name: "host0".to_string(),
                address: "192.168.0.1".parse().unwrap(),
                aliases: vec![],
            },
            HostsEntry {
                name: "host1".to_string(),
                address: "192.168.0.2".parse().unwrap(),
                aliases: vec!["www".to_string(), "mail".to_string()],
            },
        ];
        write_hosts(&path, &entries).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost.localdomain\tlocalhost\n"));
        assert!(content.contains("::1\t\tlocalhost.localdomain\tlocalhost\n"));
        assert!(content.contains("192.168.0.1\thost0\t\n"));
        assert!(content.contains("192.168.0.2\thost1\twww mail\n"));
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        let first = vec![HostsEntry {
            name: "old".to_string(),
            address: "10.0.0.1".parse().unwrap(),
            aliases: vec![],
        }];
        write_hosts(&path, &first).await.unwrap();

        let second = vec![HostsEntry {
            name: "new".to_string(),
            address: "10.0.0.2".parse().unwrap(),
            aliases: vec![],
        }];
        write_hosts(&path, &second).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("old"));
        assert!(content.contains("10.0.0.2\tnew\t\n"));
    }
}
