//! The enrolment directory.
//!
//! Every enrolled client owns a subdirectory `<root>/<client>/` holding the
//! reference image `<client>_1.jpg`. The directory listing is cached and
//! invalidated by the root directory's modification time, so a freshly
//! enrolled client becomes visible without restarting any service.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;

/// File-system view of the enrolled clients.
pub struct UserDirectory {
    root: PathBuf,
    cache: Mutex<Option<ListingCache>>,
}

struct ListingCache {
    root_mtime: SystemTime,
    names: HashSet<String>,
}

impl UserDirectory {
    /// Creates a view over the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(None),
        }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the set of enrolled client names.
    ///
    /// Re-scans only when the root directory changed since the last call;
    /// a missing root reads as "nobody enrolled".
    pub fn available(&self) -> HashSet<String> {
        let root_mtime = match std::fs::metadata(&self.root).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return HashSet::new(),
        };
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref()
            && cached.root_mtime >= root_mtime
        {
            return cached.names.clone();
        }
        let names = self.scan();
        *cache = Some(ListingCache {
            root_mtime,
            names: names.clone(),
        });
        names
    }

    /// Returns `true` iff the client has an enrolment directory.
    pub fn contains(&self, client: &str) -> bool {
        self.available().contains(client)
    }

    /// Path of the client's reference image.
    pub fn reference_image_path(&self, client: &str) -> PathBuf {
        self.root.join(client).join(format!("{client}_1.jpg"))
    }

    /// Modification time of the client's enrolment directory, if it exists.
    pub fn source_mtime(&self, client: &str) -> Option<SystemTime> {
        std::fs::metadata(self.root.join(client))
            .and_then(|m| m.modified())
            .ok()
    }

    fn scan(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return names;
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string()
                && name != "dummy"
            {
                names.insert(name);
            }
        }
        names
    }
}
