//! Declarative command whitelist, loaded from YAML, for the hook executor.
//!
//! ```yaml
//! commands:
//!   jq:
//!     allowed: true
//!     argumentPatterns: ["^\\..*$"]
//!   rm:
//!     allowed: false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Raw, uncompiled whitelist file shape.
#[derive(Debug, Deserialize)]
struct WhitelistFile {
    commands: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    allowed: bool,
    #[serde(default)]
    argument_patterns: Vec<String>,
}

struct CompiledEntry {
    allowed: bool,
    patterns: Vec<Regex>,
}

/// A loaded, compiled whitelist. Cheaply cloneable; [`Whitelist::reload`]
/// atomically swaps the active rule set.
#[derive(Clone)]
pub struct Whitelist {
    inner: Arc<RwLock<Inner>>,
    default_allow: bool,
}

struct Inner {
    commands: BTreeMap<String, CompiledEntry>,
}

impl Whitelist {
    /// Load a whitelist from `path`. `default_allow` governs the result for
    /// commands absent from the file (the production default is `false`).
    pub fn load(path: &Path, default_allow: bool) -> Result<Self> {
        let inner = load_inner(path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            default_allow,
        })
    }

    /// An empty whitelist: everything is denied unless `default_allow`.
    pub fn empty(default_allow: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                commands: BTreeMap::new(),
            })),
            default_allow,
        }
    }

    /// Reload from `path`, atomically replacing the active rule set. A
    /// compile error leaves the prior set in effect and the reload fails.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let new_inner = load_inner(path)?;
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = new_inner;
        log::info!("whitelist reloaded from {}", path.display());
        Ok(())
    }

    /// Whether `command` is allowed to run with `args`.
    ///
    /// Lookup order: exact `command`, then `basename(command)`, then
    /// [`Self::default_allow`]. If the matched entry has no argument
    /// patterns, any arguments are allowed. Otherwise every argument must
    /// match at least one pattern.
    pub fn is_allowed(&self, command: &str, args: &[String]) -> bool {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());

        let entry = inner
            .commands
            .get(command)
            .or_else(|| inner.commands.get(basename(command)));

        let Some(entry) = entry else {
            return self.default_allow;
        };

        if !entry.allowed {
            return false;
        }
        if entry.patterns.is_empty() {
            return true;
        }
        args.iter()
            .all(|arg| entry.patterns.iter().any(|p| p.is_match(arg)))
    }
}

fn basename(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command)
}

fn load_inner(path: &Path) -> Result<Inner> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read whitelist file: {}", path.display()))?;
    let raw: WhitelistFile = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse whitelist file: {}", path.display()))?;

    let mut commands = BTreeMap::new();
    for (name, entry) in raw.commands {
        let patterns = entry
            .argument_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid pattern {p:?} for command {name:?}")))
            .collect::<Result<Vec<_>>>()?;
        commands.insert(
            name,
            CompiledEntry {
                allowed: entry.allowed,
                patterns,
            },
        );
    }

    Ok(Inner { commands })
}

/// Default path the hook-executor sidecar looks for its whitelist at when
/// none is configured.
pub fn default_whitelist_path() -> PathBuf {
    PathBuf::from("/etc/excon/whitelist.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_whitelist(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("whitelist.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn denies_command_marked_not_allowed() {
        let td = tempdir().unwrap();
        let path = write_whitelist(
            &td,
            "commands:\n  rm:\n    allowed: false\n",
        );
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(!whitelist.is_allowed("rm", &["-rf".to_string(), "/".to_string()]));
    }

    #[test]
    fn allows_without_patterns_when_allowed() {
        let td = tempdir().unwrap();
        let path = write_whitelist(&td, "commands:\n  echo:\n    allowed: true\n");
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(whitelist.is_allowed("echo", &["anything".to_string()]));
    }

    #[test]
    fn requires_every_argument_to_match_a_pattern() {
        let td = tempdir().unwrap();
        let path = write_whitelist(
            &td,
            "commands:\n  jq:\n    allowed: true\n    argumentPatterns:\n      - '^\\..*$'\n",
        );
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(whitelist.is_allowed("jq", &[".foo".to_string()]));
        assert!(!whitelist.is_allowed("jq", &[".foo".to_string(), "-r".to_string()]));
    }

    #[test]
    fn falls_back_to_basename() {
        let td = tempdir().unwrap();
        let path = write_whitelist(&td, "commands:\n  jq:\n    allowed: true\n");
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(whitelist.is_allowed("/usr/bin/jq", &[]));
    }

    #[test]
    fn unknown_command_uses_default() {
        let td = tempdir().unwrap();
        let path = write_whitelist(&td, "commands:\n  jq:\n    allowed: true\n");
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(!whitelist.is_allowed("curl", &[]));

        let permissive = Whitelist::load(&path, true).unwrap();
        assert!(permissive.is_allowed("curl", &[]));
    }

    #[test]
    fn reload_replaces_active_set() {
        let td = tempdir().unwrap();
        let path = write_whitelist(&td, "commands:\n  jq:\n    allowed: true\n");
        let whitelist = Whitelist::load(&path, false).unwrap();
        assert!(whitelist.is_allowed("jq", &[]));

        write_whitelist(&td, "commands:\n  jq:\n    allowed: false\n");
        whitelist.reload(&path).unwrap();
        assert!(!whitelist.is_allowed("jq", &[]));
    }

    #[test]
    fn reload_with_bad_regex_retains_prior_set() {
        let td = tempdir().unwrap();
        let path = write_whitelist(&td, "commands:\n  jq:\n    allowed: true\n");
        let whitelist = Whitelist::load(&path, false).unwrap();

        write_whitelist(
            &td,
            "commands:\n  jq:\n    allowed: true\n    argumentPatterns:\n      - '('\n",
        );
        assert!(whitelist.reload(&path).is_err());
        // Prior set (no patterns, allowed) still in effect.
        assert!(whitelist.is_allowed("jq", &["whatever".to_string()]));
    }
}
