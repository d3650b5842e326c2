//! Discovery files advertising the running instance.
//!
//! Three plain-text files under the product cache directory make server
//! discovery O(1) for emitters: `port` (listening TCP port), `pid` (owner
//! process), and `nonce` (opaque token identifying this instance, also
//! reported by `/health`). The pid is verified with a null-signal probe on
//! every read, which keeps the triple correct across pid reuse and makes a
//! crash between writes repairable by the next reader.

use fs_err as fs;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::debug;

const PORT_FILE: &str = "port";
const PID_FILE: &str = "pid";
const NONCE_FILE: &str = "nonce";

pub const PRODUCT_DIR: &str = "beacon";

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Well-known per-user directory holding the discovery triple.
pub fn default_dir() -> Result<PathBuf, String> {
    let base = dirs::cache_dir().ok_or_else(|| "Cache directory not found".to_string())?;
    Ok(base.join(PRODUCT_DIR))
}

#[derive(Debug, Clone)]
pub struct DiscoveryDir {
    dir: PathBuf,
}

impl DiscoveryDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Port of the live owner, if any.
    ///
    /// Missing or unparseable files and dead owners are treated as stale:
    /// the triple is removed best-effort and `None` is returned.
    pub fn read_port(&self) -> Option<u16> {
        let port = match read_decimal(&self.dir.join(PORT_FILE)) {
            Some(port) if (1..=65535).contains(&port) => port as u16,
            _ => {
                self.clear();
                return None;
            }
        };
        let pid = match read_decimal(&self.dir.join(PID_FILE)) {
            Some(pid) if pid > 0 => pid as u32,
            _ => {
                self.clear();
                return None;
            }
        };

        if !is_pid_alive(pid) {
            debug!(pid, "Discovery files point at a dead process; clearing");
            self.clear();
            return None;
        }

        Some(port)
    }

    pub fn read_nonce(&self) -> Option<String> {
        let nonce = fs::read_to_string(self.dir.join(NONCE_FILE)).ok()?;
        let nonce = nonce.trim();
        if nonce.is_empty() {
            None
        } else {
            Some(nonce.to_string())
        }
    }

    /// Write the triple for this instance and return the fresh nonce.
    ///
    /// Each file goes through a tmp + rename step so a crash mid-sequence
    /// leaves at worst a stale triple that the next `read_port` repairs.
    pub fn write_triple(&self, port: u16, pid: u32) -> Result<String, String> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| format!("Failed to create discovery directory: {}", err))?;

        let nonce = new_nonce();
        write_atomic(&self.dir.join(PORT_FILE), port.to_string().as_bytes())?;
        write_atomic(&self.dir.join(PID_FILE), pid.to_string().as_bytes())?;
        write_atomic(&self.dir.join(NONCE_FILE), nonce.as_bytes())?;
        Ok(nonce)
    }

    /// Best-effort removal of the triple. Never fails loudly.
    pub fn clear(&self) {
        for name in [PORT_FILE, PID_FILE, NONCE_FILE] {
            let _ = fs::remove_file(self.dir.join(name));
        }
    }
}

/// Single-instance guard consulted before binding.
///
/// Startup must fail while a live owner still advertises a port; a stale
/// triple has already been repaired by `read_port` by the time this
/// returns `Ok`.
pub fn ensure_sole_owner(discovery: &DiscoveryDir) -> Result<(), String> {
    match discovery.read_port() {
        Some(port) => Err(format!(
            "another instance is already listening on port {} (discovery dir {})",
            port,
            discovery.path().display()
        )),
        None => Ok(()),
    }
}

fn read_decimal(path: &Path) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), String> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .map_err(|err| format!("Failed to write {}: {}", path.display(), err))?;
    fs::rename(&tmp_path, path)
        .map_err(|err| format!("Failed to commit {}: {}", path.display(), err))
}

fn new_nonce() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.next_u64())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_dir_means_no_owner() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());
        assert_eq!(discovery.read_port(), None);
    }

    #[test]
    fn triple_with_live_pid_round_trips() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        let nonce = discovery
            .write_triple(4519, std::process::id())
            .expect("write triple");
        assert_eq!(discovery.read_port(), Some(4519));
        assert_eq!(discovery.read_nonce().as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn dead_pid_is_treated_as_stale_and_cleared() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        discovery.write_triple(4519, 99999999).expect("write triple");
        assert_eq!(discovery.read_port(), None);
        // The stale triple is repaired in place.
        assert!(!temp.path().join(PORT_FILE).exists());
        assert!(!temp.path().join(PID_FILE).exists());
    }

    #[test]
    fn unparseable_files_are_cleared() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        fs::write(temp.path().join(PORT_FILE), "not-a-port").expect("write port");
        fs::write(temp.path().join(PID_FILE), std::process::id().to_string())
            .expect("write pid");

        assert_eq!(discovery.read_port(), None);
        assert!(!temp.path().join(PORT_FILE).exists());
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        fs::write(temp.path().join(PORT_FILE), "70000").expect("write port");
        fs::write(temp.path().join(PID_FILE), std::process::id().to_string())
            .expect("write pid");

        assert_eq!(discovery.read_port(), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());
        discovery.clear();
        discovery
            .write_triple(4519, std::process::id())
            .expect("write triple");
        discovery.clear();
        discovery.clear();
        assert_eq!(discovery.read_port(), None);
    }

    #[test]
    fn sole_owner_guard_names_the_live_port() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        discovery
            .write_triple(4519, std::process::id())
            .expect("write triple");
        let error = ensure_sole_owner(&discovery).expect_err("live owner must block startup");
        assert!(error.contains("4519"), "error should name the port: {}", error);
    }

    #[test]
    fn sole_owner_guard_passes_after_owner_dies() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        discovery.write_triple(4519, 99999999).expect("write triple");
        assert!(ensure_sole_owner(&discovery).is_ok());
    }

    #[test]
    fn nonce_is_fresh_per_write() {
        let temp = tempdir().expect("temp dir");
        let discovery = DiscoveryDir::new(temp.path().to_path_buf());

        let first = discovery
            .write_triple(4519, std::process::id())
            .expect("write triple");
        let second = discovery
            .write_triple(4519, std::process::id())
            .expect("write triple");
        assert_ne!(first, second);
    }
}
