use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// Objects a cached value was computed from, and the modification version at
/// the time it was computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessInfo {
    objects: BTreeSet<String>,
    version: u64,
}

impl AccessInfo {
    pub fn new<S: AsRef<str>>(objects: impl IntoIterator<Item = S>, version: u64) -> Self {
        AccessInfo {
            objects: objects
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
            version,
        }
    }

    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|s| s.as_str())
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ObjectVersions {
    /// Version of the last modification of any kind.
    any: u64,
    /// Version of the last structural modification.
    major: u64,
}

/// Tracks modifications to objects so that stale cache entries can be
/// detected.
///
/// Every modification bumps a global version. Cached values remember the
/// version they were computed at.
#[derive(Debug, Default)]
pub struct ModificationTracker {
    version: AtomicU64,
    objects: Mutex<HashMap<String, ObjectVersions>>,
}

impl ModificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Record a modification of an object.
    ///
    /// Major modifications (e.g. deleting every row, dropping) invalidate
    /// plans. Any modification invalidates data.
    pub fn record_modification(&self, object: &str, major: bool) {
        let mut objects = self.objects.lock();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = objects.entry(object.to_lowercase()).or_default();
        entry.any = version;
        if major {
            entry.major = version;
        }
        debug!(%object, %major, %version, "recorded modification");
    }

    /// Check if a value computed with the given access info is still valid.
    pub fn is_valid(&self, info: &AccessInfo, data_dependent: bool) -> bool {
        let objects = self.objects.lock();
        info.objects.iter().all(|obj| match objects.get(obj) {
            Some(versions) => {
                let modified = if data_dependent {
                    versions.any
                } else {
                    versions.major
                };
                modified <= info.version
            }
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_change_keeps_plans() {
        let tracker = ModificationTracker::new();
        let info = AccessInfo::new(["PM1.G1"], tracker.current_version());

        tracker.record_modification("pm1.g1", false);
        assert!(tracker.is_valid(&info, false));
        assert!(!tracker.is_valid(&info, true));

        tracker.record_modification("pm1.g1", true);
        assert!(!tracker.is_valid(&info, false));
    }

    #[test]
    fn unrelated_objects_ignored() {
        let tracker = ModificationTracker::new();
        let info = AccessInfo::new(["pm1.g1"], tracker.current_version());
        tracker.record_modification("pm1.g2", true);
        assert!(tracker.is_valid(&info, true));

        let later = AccessInfo::new(["pm1.g2"], tracker.current_version());
        assert!(tracker.is_valid(&later, true));
    }
}
