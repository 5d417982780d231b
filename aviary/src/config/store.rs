//! Configuration documents and their resolution.
//!
//! A module named `m` reads its configuration from `config_m.yaml`,
//! located through the [`super::FileLocator`]. Each document carries a
//! `config:` mapping and an optional `self_test:` overlay whose keys
//! shadow the production mapping while the current request is a
//! self-test. String values are expanded as macros against the contents
//! of `config_config.yaml` merged with the built-ins `__node__`,
//! `__cage__` and `__cage_dir__`.
//!
//! Documents are re-parsed when their settled modification time advances;
//! every re-parse bumps a process-wide version counter, which is how the
//! lifecycle orchestrator notices that an interface needs restarting.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use faststr::FastStr;

use super::{locator::FileLocator, template};
use crate::{
    error::{Error, Result},
    request,
    value::{Value, ValueMap},
};

/// The module holding the macro dictionary; it is itself never expanded.
const MACRO_MODULE: &str = "config";

pub struct ConfigDoc {
    pub name: FastStr,
    pub path: PathBuf,
    pub mtime: SystemTime,
    pub version: u64,
    config: ValueMap,
    self_test: ValueMap,
}

struct MacroCache {
    version: Option<u64>,
    vars: Arc<ValueMap>,
}

pub struct ConfigStore {
    node: FastStr,
    cage: FastStr,
    locator: FileLocator,
    docs: DashMap<FastStr, Arc<ConfigDoc>>,
    next_version: AtomicU64,
    macros: ArcSwap<MacroCache>,
}

impl ConfigStore {
    pub fn new(
        node: impl Into<FastStr>,
        cage: impl Into<FastStr>,
        cage_dir: impl Into<PathBuf>,
        cache_timeout: Duration,
        settle_timeout: Duration,
    ) -> Result<Self> {
        Ok(ConfigStore {
            node: node.into(),
            cage: cage.into(),
            locator: FileLocator::new(cage_dir, cache_timeout, settle_timeout)?,
            docs: DashMap::new(),
            next_version: AtomicU64::new(0),
            macros: ArcSwap::new(Arc::new(MacroCache {
                version: None,
                vars: Arc::new(ValueMap::new()),
            })),
        })
    }

    pub fn node(&self) -> &FastStr {
        &self.node
    }

    pub fn cage(&self) -> &FastStr {
        &self.cage
    }

    pub fn cage_dir(&self) -> &std::path::Path {
        self.locator.cage_dir()
    }

    /// The parsed document for module `module`, re-reading it if the file
    /// moved or its settled modification time advanced.
    pub fn document(&self, module: &str) -> Result<Arc<ConfigDoc>> {
        let file_name = format!("config_{module}.yaml");
        let (path, mtime) = self.locator.locate(&file_name)?.ok_or_else(|| {
            Error::config(format!("configuration module '{file_name}' not found"))
        })?;

        if let Some(doc) = self.docs.get(module) {
            if doc.path == path && doc.mtime == mtime {
                return Ok(doc.clone());
            }
        }

        let parsed = Arc::new(self.parse(module, path, mtime)?);
        self.docs.insert(FastStr::new(module), parsed.clone());
        tracing::debug!(
            "[AVIARY] configuration module '{}' (re)loaded as version {}",
            parsed.name,
            parsed.version
        );
        Ok(parsed)
    }

    /// The version of a module's configuration, bumped on every reload.
    pub fn version(&self, module: &str) -> Option<u64> {
        self.document(module).ok().map(|doc| doc.version)
    }

    /// One configuration value, with the self-test overlay and macro
    /// expansion applied.
    pub fn get(&self, module: &str, key: &str) -> Result<Value> {
        let doc = self.document(module)?;
        let raw = self
            .overlay_lookup(&doc, key)
            .ok_or_else(|| {
                Error::config(format!("config_{module} does not define '{key}'"))
            })?
            .clone();
        if module == MACRO_MODULE {
            return Ok(raw);
        }
        template::expand(&raw, &self.vars())
    }

    /// Like [`get`](Self::get), falling back to `default` on any failure
    /// (which is logged, not propagated).
    pub fn get_or(&self, module: &str, key: &str, default: Value) -> Value {
        match self.get(module, key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "[AVIARY] falling back to the default for config_{module}:{key}: {e}"
                );
                default
            }
        }
    }

    /// The whole configuration mapping, overlay applied, values expanded.
    pub fn copy(&self, module: &str) -> Result<ValueMap> {
        let doc = self.document(module)?;
        let mut merged = doc.config.clone();
        if self.self_test_active() {
            for (key, value) in doc.self_test.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        if module == MACRO_MODULE {
            return Ok(merged);
        }
        let vars = self.vars();
        let mut expanded = ValueMap::new();
        for (key, value) in merged.iter() {
            expanded.insert(key.clone(), template::expand(value, &vars)?);
        }
        Ok(expanded)
    }

    fn overlay_lookup<'a>(&self, doc: &'a ConfigDoc, key: &str) -> Option<&'a Value> {
        if self.self_test_active() {
            if let Some(value) = doc.self_test.get(key) {
                return Some(value);
            }
        }
        doc.config.get(key)
    }

    fn self_test_active(&self) -> bool {
        request::current()
            .map(|r| r.self_test().is_some())
            .unwrap_or(false)
    }

    /// The macro dictionary: `config_config` (overlay applied) merged
    /// with the built-ins. Cached per document version for the common
    /// non-self-test path.
    fn vars(&self) -> Arc<ValueMap> {
        let doc = self.document(MACRO_MODULE).ok();
        let version = doc.as_ref().map(|d| d.version);

        if !self.self_test_active() {
            let cached = self.macros.load();
            if cached.version.is_some() && cached.version == Some(version.unwrap_or(0)) {
                return cached.vars.clone();
            }
        }

        let mut vars = match &doc {
            Some(doc) => {
                let mut vars = doc.config.clone();
                if self.self_test_active() {
                    for (key, value) in doc.self_test.iter() {
                        vars.insert(key.clone(), value.clone());
                    }
                }
                vars
            }
            None => ValueMap::new(),
        };
        vars.insert("__node__".into(), Value::Str(self.node.clone()));
        vars.insert("__cage__".into(), Value::Str(self.cage.clone()));
        vars.insert(
            "__cage_dir__".into(),
            Value::from(self.locator.cage_dir().display().to_string()),
        );
        let vars = Arc::new(vars);

        if !self.self_test_active() {
            self.macros.store(Arc::new(MacroCache {
                version: Some(version.unwrap_or(0)),
                vars: vars.clone(),
            }));
        }
        vars
    }

    fn parse(&self, module: &str, path: PathBuf, mtime: SystemTime) -> Result<ConfigDoc> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let root = Value::from_yaml(yaml)?;
        let config = match root.get("config") {
            Some(Value::Map(map)) => map.clone(),
            Some(other) => {
                return Err(Error::config(format!(
                    "{}: 'config' must be a mapping, got {}",
                    path.display(),
                    other.kind()
                )))
            }
            None => {
                return Err(Error::config(format!(
                    "{}: missing the 'config' mapping",
                    path.display()
                )))
            }
        };
        let self_test = match root.get("self_test") {
            Some(Value::Map(map)) => map.clone(),
            Some(other) => {
                return Err(Error::config(format!(
                    "{}: 'self_test' must be a mapping, got {}",
                    path.display(),
                    other.kind()
                )))
            }
            None => ValueMap::new(),
        };
        Ok(ConfigDoc {
            name: FastStr::new(module),
            path,
            mtime,
            version: self.next_version.fetch_add(1, Ordering::Relaxed) + 1,
            config,
            self_test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    const CACHE: Duration = Duration::from_millis(50);
    const SETTLE: Duration = Duration::from_millis(150);

    struct Cage {
        _root: tempfile::TempDir,
        cage_dir: PathBuf,
        store: ConfigStore,
    }

    fn cage_with(files: &[(&str, &str)]) -> Cage {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join(".shared");
        let cage_dir = root.path().join("test");
        std::fs::create_dir(&shared).unwrap();
        std::fs::create_dir(&cage_dir).unwrap();
        for (name, content) in files {
            std::fs::write(cage_dir.join(name), content).unwrap();
        }
        let store = ConfigStore::new("node1", "test", &cage_dir, CACHE, SETTLE).unwrap();
        Cage {
            _root: root,
            cage_dir,
            store,
        }
    }

    const MACROS: &str = "config:\n  key: value\n  number: 123\n";

    #[test]
    fn get_expands_macros_and_builtins() {
        let cage = cage_with(&[
            ("config_config.yaml", MACROS),
            (
                "config_demo.yaml",
                "config:\n  a: key\n  b: $key\n  cage: $__cage__\n  node: ${__node__}\n  dir: ${__cage_dir__}\n",
            ),
        ]);
        assert_eq!(cage.store.get("demo", "a").unwrap(), Value::from("key"));
        assert_eq!(cage.store.get("demo", "b").unwrap(), Value::from("value"));
        assert_eq!(cage.store.get("demo", "cage").unwrap(), Value::from("test"));
        assert_eq!(cage.store.get("demo", "node").unwrap(), Value::from("node1"));
        assert_eq!(
            cage.store.get("demo", "dir").unwrap(),
            Value::from(cage.cage_dir.display().to_string())
        );
    }

    #[test]
    fn missing_keys_fall_back_with_get_or() {
        let cage = cage_with(&[("config_demo.yaml", "config:\n  a: 1\n")]);
        assert_eq!(cage.store.get("demo", "a").unwrap(), Value::Int(1));
        assert!(cage.store.get("demo", "b").is_err());
        assert_eq!(
            cage.store.get_or("demo", "b", Value::from("fallback")),
            Value::from("fallback")
        );
        assert!(cage.store.get("missing_module", "a").is_err());
    }

    #[tokio::test]
    async fn self_test_overlay_shadows_in_get_and_copy() {
        let cage = cage_with(&[(
            "config_demo.yaml",
            "config:\n  a: production\n  b: both\nself_test:\n  a: testing\n  c: extra\n",
        )]);

        // without a self-test request the overlay is invisible
        assert_eq!(cage.store.get("demo", "a").unwrap(), Value::from("production"));
        assert!(cage.store.get("demo", "c").is_err());
        let copied = cage.store.copy("demo").unwrap();
        assert_eq!(copied.len(), 2);

        let store = &cage.store;
        request::with_request(Request::fake(Duration::from_secs(10)), async move {
            assert_eq!(store.get("demo", "a").unwrap(), Value::from("testing"));
            assert_eq!(store.get("demo", "b").unwrap(), Value::from("both"));
            assert_eq!(store.get("demo", "c").unwrap(), Value::from("extra"));
            let copied = store.copy("demo").unwrap();
            assert_eq!(copied.get("a"), Some(&Value::from("testing")));
            assert_eq!(copied.get("c"), Some(&Value::from("extra")));
        })
        .await;
    }

    #[tokio::test]
    async fn self_test_macro_expansion_scenario() {
        let russian = "\u{410}\u{411}\u{412}\u{430}\u{431}\u{432}";
        let macros = format!(
            "config:\n  key: value\n  russian: \"{russian}\"\n  number: 123\n  bytes: !binary AA==\n"
        );
        let demo = concat!(
            "config: {}\n",
            "self_test:\n",
            "  c: \"${key}${{key}}$$key{$}key$keykey{key$}{{$key{{${key$key}\"\n",
            "  number: eval(int($number))\n",
            "  bytes: !binary AA==\n",
            "  russian: $russian\n",
        );
        let cage = cage_with(&[
            ("config_config.yaml", macros.as_str()),
            ("config_demo.yaml", demo),
        ]);

        let store = &cage.store;
        request::with_request(Request::fake(Duration::from_secs(10)), async move {
            assert_eq!(store.get("demo", "number").unwrap(), Value::Int(123));
            assert_eq!(
                store.get("demo", "c").unwrap(),
                Value::from("value${{key}}$key{$}key$keykey{key$}{{value{{${keyvalue}")
            );
            assert_eq!(
                store.get("demo", "bytes").unwrap(),
                Value::bytes(&b"\x00"[..])
            );
            assert_eq!(store.get("demo", "russian").unwrap(), Value::from(russian));
        })
        .await;
    }

    #[test]
    fn reload_bumps_the_version_after_settling() {
        let cage = cage_with(&[("config_demo.yaml", "config:\n  interval: 10\n")]);
        assert_eq!(cage.store.get("demo", "interval").unwrap(), Value::Int(10));
        let version = cage.store.version("demo").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(
            cage.cage_dir.join("config_demo.yaml"),
            "config:\n  interval: 1\n",
        )
        .unwrap();

        // still the old content while the change settles
        assert_eq!(cage.store.get("demo", "interval").unwrap(), Value::Int(10));

        let give_up = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            std::thread::sleep(Duration::from_millis(100));
            if cage.store.get("demo", "interval").unwrap() == Value::Int(1) {
                break;
            }
            assert!(std::time::Instant::now() < give_up, "reload never settled");
        }
        assert!(cage.store.version("demo").unwrap() > version);
    }

    #[test]
    fn macro_changes_invalidate_the_cached_dictionary() {
        let cage = cage_with(&[
            ("config_config.yaml", "config:\n  env: dev\n"),
            ("config_demo.yaml", "config:\n  url: http://$env.example.com\n"),
        ]);
        assert_eq!(
            cage.store.get("demo", "url").unwrap(),
            Value::from("http://dev.example.com")
        );

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(
            cage.cage_dir.join("config_config.yaml"),
            "config:\n  env: prod\n",
        )
        .unwrap();

        let give_up = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            std::thread::sleep(Duration::from_millis(100));
            if cage.store.get("demo", "url").unwrap() == Value::from("http://prod.example.com") {
                break;
            }
            assert!(std::time::Instant::now() < give_up, "macros never reloaded");
        }
    }
}
