use crate::types::SignatureStatus;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Signature check for hosts without code signing: a root-owned binary
/// under a trusted system prefix counts as signed.
#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    trusted_prefixes: Vec<PathBuf>,
    cache: HashMap<PathBuf, SignatureStatus>,
}

impl SignaturePolicy {
    pub fn new(trusted_prefixes: Vec<PathBuf>) -> Self {
        Self {
            trusted_prefixes,
            cache: HashMap::new(),
        }
    }

    pub fn status(&mut self, exe: Option<&Path>) -> SignatureStatus {
        let Some(exe) = exe else {
            return SignatureStatus::Unknown;
        };
        if let Some(status) = self.cache.get(exe) {
            return *status;
        }
        let status = self.inspect(exe);
        // Unknown is usually a transient permission problem; retry next time.
        if status != SignatureStatus::Unknown {
            self.cache.insert(exe.to_path_buf(), status);
        }
        status
    }

    /// Drop cached verdicts for executables no longer running.
    pub fn retain_running(&mut self, running: &HashSet<&Path>) {
        self.cache.retain(|exe, _| running.contains(exe.as_path()));
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn inspect(&self, exe: &Path) -> SignatureStatus {
        let Ok(meta) = std::fs::metadata(exe) else {
            return SignatureStatus::Unknown;
        };
        let trusted = self.trusted_prefixes.iter().any(|p| exe.starts_with(p));
        if trusted && owned_by_root(&meta) {
            SignatureStatus::Signed
        } else {
            SignatureStatus::Unsigned
        }
    }
}

#[cfg(unix)]
fn owned_by_root(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.uid() == 0
}

#[cfg(not(unix))]
fn owned_by_root(_meta: &std::fs::Metadata) -> bool {
    true
}
