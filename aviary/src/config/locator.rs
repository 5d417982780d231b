//! Configuration file lookup within a cage.
//!
//! Files are looked up first in the cage's own directory, then in the
//! sibling `.shared` directory. The directory snapshot is cached for
//! `cache_timeout`; when a change is observed, a `settle_timeout` window
//! must pass with no further change before the new snapshot is adopted,
//! which guards readers against half-written files.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use regex::Regex;

use crate::error::{Error, Result};

/// File name -> (full path, last modification time). The modification
/// time participates in snapshot comparison, so an in-place rewrite is a
/// change that settles like any other.
type Snapshot = HashMap<String, (PathBuf, SystemTime)>;

pub struct FileLocator {
    cage_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    cache_timeout: Duration,
    settle_timeout: Duration,
    name_pattern: Regex,
    state: Mutex<LocatorState>,
}

struct LocatorState {
    current: Option<Arc<Snapshot>>,
    refreshed: Instant,
    settling: Option<(Arc<Snapshot>, Instant)>,
}

impl FileLocator {
    pub fn new(
        cage_dir: impl Into<PathBuf>,
        cache_timeout: Duration,
        settle_timeout: Duration,
    ) -> Result<Self> {
        let cage_dir: PathBuf = cage_dir.into();
        if !cage_dir.is_dir() {
            return Err(Error::config(format!(
                "cage directory {} does not exist",
                cage_dir.display()
            )));
        }
        let shared_dir = cage_dir
            .parent()
            .map(|parent| parent.join(".shared"))
            .filter(|dir| dir.is_dir());
        Ok(FileLocator {
            cage_dir,
            shared_dir,
            cache_timeout,
            settle_timeout,
            name_pattern: Regex::new(r"^[A-Za-z0-9_-]{1,128}\.ya?ml$")
                .expect("static pattern"),
            state: Mutex::new(LocatorState {
                current: None,
                refreshed: Instant::now(),
                settling: None,
            }),
        })
    }

    pub fn cage_dir(&self) -> &Path {
        &self.cage_dir
    }

    /// Where `file_name` currently resolves, together with the settled
    /// modification time, or `None` if no such file exists in the cage.
    pub fn locate(&self, file_name: &str) -> Result<Option<(PathBuf, SystemTime)>> {
        if !self.name_pattern.is_match(file_name) {
            return Err(Error::config(format!(
                "invalid configuration file name '{file_name}'"
            )));
        }
        Ok(self.snapshot().get(file_name).cloned())
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let mut state = self.state.lock();
        if state.current.is_none() {
            // initial state, the directory contents are unknown yet
            state.current = Some(Arc::new(self.read_snapshot()));
            state.refreshed = Instant::now();
        } else if let Some((settling, settle_deadline)) = state.settling.clone() {
            // a change has been detected previously and is being settled
            if Instant::now() >= settle_deadline {
                let fresh = Arc::new(self.read_snapshot());
                if *fresh != *settling {
                    // another change occurred since last time, keep settling
                    state.settling = Some((fresh, Instant::now() + self.settle_timeout));
                } else {
                    state.refreshed = Instant::now();
                    state.current = Some(fresh);
                    state.settling = None;
                }
            }
        } else if state.refreshed.elapsed() >= self.cache_timeout {
            state.refreshed = Instant::now();
            let fresh = Arc::new(self.read_snapshot());
            if state.current.as_deref() != Some(&*fresh) {
                if self.settle_timeout > Duration::ZERO {
                    state.settling = Some((fresh, Instant::now() + self.settle_timeout));
                } else {
                    state.current = Some(fresh);
                }
            }
        }
        state.current.clone().expect("populated above")
    }

    fn read_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        if let Some(shared) = &self.shared_dir {
            read_dir_into(shared, &mut snapshot);
        }
        read_dir_into(&self.cage_dir, &mut snapshot);
        snapshot
    }
}

fn read_dir_into(dir: &Path, snapshot: &mut Snapshot) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        snapshot.insert(name, (entry.path(), mtime));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHE: Duration = Duration::from_millis(50);
    const SETTLE: Duration = Duration::from_millis(250);

    struct Dirs {
        _root: tempfile::TempDir,
        shared: PathBuf,
        cage: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join(".shared");
        let cage = root.path().join("test");
        std::fs::create_dir(&shared).unwrap();
        std::fs::create_dir(&cage).unwrap();
        Dirs {
            _root: root,
            shared,
            cage,
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"config: {}\n").unwrap();
        path
    }

    fn located(locator: &FileLocator, name: &str) -> Option<PathBuf> {
        locator.locate(name).unwrap().map(|(path, _)| path)
    }

    #[test]
    fn rejects_bad_names() {
        let dirs = dirs();
        let locator = FileLocator::new(&dirs.cage, CACHE, SETTLE).unwrap();
        assert!(locator.locate("foo.txt").is_err());
        assert!(locator.locate("foo..yaml").is_err());
        assert!(locator.locate("../foo.yaml").is_err());
    }

    #[test]
    fn missing_cage_directory_is_an_error() {
        let dirs = dirs();
        assert!(FileLocator::new(dirs.cage.join("nope"), CACHE, SETTLE).is_err());
    }

    #[test]
    fn cage_files_shadow_shared_files() {
        let dirs = dirs();
        let shared_bar = touch(&dirs.shared, "bar.yaml");
        touch(&dirs.shared, "foo.yaml");
        let cage_foo = touch(&dirs.cage, "foo.yaml");

        let locator = FileLocator::new(&dirs.cage, CACHE, SETTLE).unwrap();
        assert_eq!(located(&locator, "bar.yaml"), Some(shared_bar));
        assert_eq!(located(&locator, "foo.yaml"), Some(cage_foo));
        assert_eq!(located(&locator, "baz.yaml"), None);
    }

    #[test]
    fn a_new_file_is_adopted_only_after_settling() {
        let dirs = dirs();
        let shared_bar = touch(&dirs.shared, "bar.yaml");
        let locator = FileLocator::new(&dirs.cage, CACHE, SETTLE).unwrap();
        assert_eq!(located(&locator, "bar.yaml"), Some(shared_bar.clone()));

        let cage_bar = touch(&dirs.cage, "bar.yaml");

        // within the cache window nothing changes
        assert_eq!(located(&locator, "bar.yaml"), Some(shared_bar.clone()));
        // past the cache window the change is noticed but still settling
        std::thread::sleep(CACHE + Duration::from_millis(20));
        assert_eq!(located(&locator, "bar.yaml"), Some(shared_bar.clone()));
        // once the settle window passes quietly the change is adopted
        std::thread::sleep(SETTLE + Duration::from_millis(50));
        assert_eq!(located(&locator, "bar.yaml"), Some(cage_bar));
    }

    #[test]
    fn repeated_rewrites_keep_settling_until_quiet() {
        let dirs = dirs();
        touch(&dirs.cage, "foo.yaml");
        let locator = FileLocator::new(&dirs.cage, CACHE, SETTLE).unwrap();
        let (_, first_mtime) = locator.locate("foo.yaml").unwrap().unwrap();

        // keep rewriting within the settle window; the settled snapshot
        // must not move until the writes stop
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(dirs.cage.join("foo.yaml"), b"config: {a: 1}\n").unwrap();
            let (_, mtime) = locator.locate("foo.yaml").unwrap().unwrap();
            assert_eq!(mtime, first_mtime);
        }

        // once the writes stop, repeated lookups drive the settling state
        // machine until the final content is adopted
        let give_up = Instant::now() + Duration::from_secs(3);
        loop {
            std::thread::sleep(Duration::from_millis(100));
            let (_, mtime) = locator.locate("foo.yaml").unwrap().unwrap();
            if mtime != first_mtime {
                break;
            }
            assert!(Instant::now() < give_up, "snapshot never settled");
        }
    }

    #[test]
    fn removed_file_falls_back_to_shared() {
        let dirs = dirs();
        let shared_foo = touch(&dirs.shared, "foo.yaml");
        let cage_foo = touch(&dirs.cage, "foo.yaml");
        let locator = FileLocator::new(&dirs.cage, CACHE, SETTLE).unwrap();
        assert_eq!(located(&locator, "foo.yaml"), Some(cage_foo.clone()));

        std::fs::remove_file(&cage_foo).unwrap();
        assert_eq!(located(&locator, "foo.yaml"), Some(cage_foo));
        let give_up = Instant::now() + Duration::from_secs(3);
        loop {
            std::thread::sleep(Duration::from_millis(100));
            if located(&locator, "foo.yaml") == Some(shared_foo.clone()) {
                break;
            }
            assert!(Instant::now() < give_up, "removal never settled");
        }
    }
}
