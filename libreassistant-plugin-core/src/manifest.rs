//! # Manifest Registry Module
//!
//! Discovers locally installed plugins and turns their on-disk manifests
//! into validated, immutable descriptors.
//!
//! A plugin is a subdirectory of the configured plugins root containing a
//! `plugin.toml` manifest:
//!
//! ```toml
//! id = "search"
//! name = "Web Search"
//! version = "1.2.0"
//! description = "Search the local document index"
//! author = "LibreAssistant Contributors"
//! entrypoint = "python3 server.py"
//! port = 5101
//! permissions = ["network", "file-read"]
//! homepage = "https://example.org/search-plugin"
//! license = "MIT"
//!
//! [options.max_results]
//! type = "number"
//! required = false
//! default = 10
//! description = "Maximum results per query"
//! ```
//!
//! Scanning is an explicit operation: `PluginRegistry::scan` walks the root
//! once and swaps the descriptor map wholesale. There is no filesystem
//! watching. Invalid manifests are skipped, recorded in `scan_errors`, and
//! logged; they never abort the scan.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::ManifestError;

/// Manifest file name expected in each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Closed vocabulary of capabilities a plugin may request.
///
/// Manifests declaring anything outside this set are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    FileRead,
    FileWrite,
    Network,
    Clipboard,
    SystemInfo,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FileRead => "file-read",
            Capability::FileWrite => "file-write",
            Capability::Network => "network",
            Capability::Clipboard => "clipboard",
            Capability::SystemInfo => "system-info",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-read" => Ok(Capability::FileRead),
            "file-write" => Ok(Capability::FileWrite),
            "network" => Ok(Capability::Network),
            "clipboard" => Ok(Capability::Clipboard),
            "system-info" => Ok(Capability::SystemInfo),
            _ => Err(()),
        }
    }
}

/// Value type of a user-configurable plugin option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    String,
    Number,
    Boolean,
}

/// Schema entry for one user-configurable option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    #[serde(rename = "type")]
    pub option_type: OptionType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<toml::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Raw serde shape of `plugin.toml`.
///
/// Permissions are strings here so that unknown capabilities produce a
/// typed `UnknownCapability` error instead of an opaque parse failure.
/// Unknown top-level fields are ignored.
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: String,
    name: String,
    version: String,
    description: String,
    author: String,
    entrypoint: String,
    port: i64,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    options: BTreeMap<String, OptionSpec>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    license: Option<String>,
}

/// Validated, immutable plugin metadata.
///
/// Descriptors are handed out as `Arc<PluginDescriptor>` and never mutated
/// after a scan; a re-scan produces fresh descriptors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Entrypoint program, split from the manifest command line.
    pub program: String,
    /// Remaining entrypoint arguments.
    pub args: Vec<String>,
    /// Declared loopback port, within [1024, 65535].
    pub port: u16,
    pub permissions: BTreeSet<Capability>,
    pub options: BTreeMap<String, OptionSpec>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    /// Directory the manifest was loaded from; the plugin's working dir.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// A scan failure scoped to one candidate directory.
#[derive(Debug)]
pub struct ScanError {
    pub dir: PathBuf,
    pub error: ManifestError,
}

fn valid_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("id is empty");
    }
    if id.starts_with('-') || id.ends_with('-') || id.contains("--") {
        return Err("hyphens must separate non-empty segments");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("only lowercase letters, digits and hyphens are allowed");
    }
    Ok(())
}

/// Parse and validate a manifest document.
pub fn parse_manifest(source: &str, base_dir: &Path) -> Result<PluginDescriptor, ManifestError> {
    let raw: RawManifest = toml::from_str(source)?;

    if let Err(reason) = valid_id(&raw.id) {
        return Err(ManifestError::InvalidId {
            id: raw.id,
            reason,
        });
    }

    if !(1024..=65535).contains(&raw.port) {
        return Err(ManifestError::PortOutOfRange {
            id: raw.id,
            port: raw.port,
        });
    }

    let mut permissions = BTreeSet::new();
    for permission in &raw.permissions {
        match Capability::from_str(permission) {
            Ok(capability) => {
                permissions.insert(capability);
            }
            Err(()) => {
                return Err(ManifestError::UnknownCapability {
                    id: raw.id,
                    capability: permission.clone(),
                });
            }
        }
    }

    let mut parts = raw.entrypoint.split_whitespace();
    let program = match parts.next() {
        Some(program) => program.to_string(),
        None => return Err(ManifestError::EmptyEntrypoint { id: raw.id }),
    };
    let args = parts.map(str::to_string).collect();

    Ok(PluginDescriptor {
        id: raw.id,
        name: raw.name,
        version: raw.version,
        description: raw.description,
        author: raw.author,
        program,
        args,
        port: raw.port as u16,
        permissions,
        options: raw.options,
        homepage: raw.homepage,
        license: raw.license,
        base_dir: base_dir.to_path_buf(),
    })
}

/// Registry of discovered plugins, keyed by id.
pub struct PluginRegistry {
    root: PathBuf,
    plugins: RwLock<HashMap<String, Arc<PluginDescriptor>>>,
    scan_errors: RwLock<Vec<ScanError>>,
}

impl PluginRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            plugins: RwLock::new(HashMap::new()),
            scan_errors: RwLock::new(Vec::new()),
        }
    }

    /// Plugins root this registry scans.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the plugins root and rebuild the descriptor map.
    ///
    /// Each immediate subdirectory holding a `plugin.toml` is a candidate.
    /// Invalid manifests are skipped and recorded; the scan itself only
    /// fails when the root cannot be read at all. Returns the number of
    /// plugins loaded.
    pub fn scan(&self) -> Result<usize, std::io::Error> {
        let mut loaded: HashMap<String, Arc<PluginDescriptor>> = HashMap::new();
        let mut errors = Vec::new();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        entries.sort();

        for dir in entries {
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }

            let result = std::fs::read_to_string(&manifest_path)
                .map_err(ManifestError::from)
                .and_then(|source| parse_manifest(&source, &dir));

            match result {
                Ok(descriptor) => {
                    if loaded.contains_key(&descriptor.id) {
                        tracing::warn!(
                            plugin = %descriptor.id,
                            dir = %dir.display(),
                            "skipping plugin with duplicate id"
                        );
                        errors.push(ScanError {
                            dir,
                            error: ManifestError::DuplicateId { id: descriptor.id },
                        });
                        continue;
                    }
                    tracing::debug!(
                        plugin = %descriptor.id,
                        version = %descriptor.version,
                        port = descriptor.port,
                        "loaded plugin manifest"
                    );
                    loaded.insert(descriptor.id.clone(), Arc::new(descriptor));
                }
                Err(error) => {
                    tracing::warn!(dir = %dir.display(), %error, "skipping invalid plugin manifest");
                    errors.push(ScanError { dir, error });
                }
            }
        }

        let count = loaded.len();
        *self.plugins.write().expect("registry lock poisoned") = loaded;
        *self.scan_errors.write().expect("registry lock poisoned") = errors;
        tracing::info!(plugins = count, root = %self.root.display(), "plugin scan complete");
        Ok(count)
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// All descriptors, sorted by id.
    pub fn descriptors(&self) -> Vec<Arc<PluginDescriptor>> {
        let mut all: Vec<_> = self
            .plugins
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of all known plugins, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.descriptors().iter().map(|d| d.id.clone()).collect()
    }

    /// Errors recorded by the most recent scan, rendered for display.
    pub fn scan_errors(&self) -> Vec<String> {
        self.scan_errors
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|e| format!("{}: {}", e.dir.display(), e.error))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
id = "search"
name = "Web Search"
version = "1.2.0"
description = "Search the local document index"
author = "LibreAssistant Contributors"
entrypoint = "python3 server.py --fast"
port = 5101
permissions = ["network", "file-read"]

[options.max_results]
type = "number"
required = false
default = 10
description = "Maximum results per query"
"#;

    #[test]
    fn parses_valid_manifest() {
        let descriptor = parse_manifest(VALID, Path::new("/tmp/search")).unwrap();
        assert_eq!(descriptor.id, "search");
        assert_eq!(descriptor.program, "python3");
        assert_eq!(descriptor.args, vec!["server.py", "--fast"]);
        assert_eq!(descriptor.port, 5101);
        assert!(descriptor.permissions.contains(&Capability::Network));
        assert!(descriptor.permissions.contains(&Capability::FileRead));
        assert_eq!(descriptor.options.len(), 1);
        assert_eq!(
            descriptor.options["max_results"].option_type,
            OptionType::Number
        );
    }

    #[test]
    fn reparse_yields_equal_descriptor() {
        let a = parse_manifest(VALID, Path::new("/tmp/search")).unwrap();
        let b = parse_manifest(VALID, Path::new("/tmp/search")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "Search", "my_plugin", "-search", "search-", "a--b"] {
            let source = VALID.replace("id = \"search\"", &format!("id = \"{bad}\""));
            let err = parse_manifest(&source, Path::new("/tmp/p")).unwrap_err();
            assert!(
                matches!(err, ManifestError::InvalidId { .. } | ManifestError::Parse(_)),
                "id {bad:?} produced {err:?}"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_port() {
        for port in ["80", "0", "70000"] {
            let source = VALID.replace("port = 5101", &format!("port = {port}"));
            let err = parse_manifest(&source, Path::new("/tmp/p")).unwrap_err();
            assert!(matches!(err, ManifestError::PortOutOfRange { .. }));
        }
    }

    #[test]
    fn rejects_unknown_capability() {
        let source = VALID.replace("\"file-read\"", "\"root-access\"");
        let err = parse_manifest(&source, Path::new("/tmp/p")).unwrap_err();
        match err {
            ManifestError::UnknownCapability { capability, .. } => {
                assert_eq!(capability, "root-access");
            }
            other => panic!("expected UnknownCapability, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_required_field() {
        let source = VALID.replace("author = \"LibreAssistant Contributors\"\n", "");
        assert!(matches!(
            parse_manifest(&source, Path::new("/tmp/p")),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn ignores_unknown_fields() {
        let source = format!("{VALID}\nfuture_field = \"ignored\"\n");
        assert!(parse_manifest(&source, Path::new("/tmp/p")).is_ok());
    }

    #[test]
    fn empty_entrypoint_rejected() {
        let source = VALID.replace("entrypoint = \"python3 server.py --fast\"", "entrypoint = \"  \"");
        assert!(matches!(
            parse_manifest(&source, Path::new("/tmp/p")),
            Err(ManifestError::EmptyEntrypoint { .. })
        ));
    }

    #[test]
    fn scan_skips_invalid_and_keeps_valid() {
        let root = tempfile::tempdir().unwrap();

        let good = root.path().join("search");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(good.join(MANIFEST_FILE), VALID).unwrap();

        let bad = root.path().join("broken");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE), "id = 42").unwrap();

        let no_manifest = root.path().join("empty");
        std::fs::create_dir(&no_manifest).unwrap();

        let registry = PluginRegistry::new(root.path());
        let count = registry.scan().unwrap();

        assert_eq!(count, 1);
        assert!(registry.get("search").is_some());
        assert_eq!(registry.scan_errors().len(), 1);
    }

    #[test]
    fn rescan_replaces_previous_state() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("search");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), VALID).unwrap();

        let registry = PluginRegistry::new(root.path());
        registry.scan().unwrap();
        assert!(registry.get("search").is_some());

        std::fs::remove_file(dir.join(MANIFEST_FILE)).unwrap();
        registry.scan().unwrap();
        assert!(registry.get("search").is_none());
        assert!(registry.descriptors().is_empty());
    }

    #[test]
    fn capability_round_trip() {
        for capability in [
            Capability::FileRead,
            Capability::FileWrite,
            Capability::Network,
            Capability::Clipboard,
            Capability::SystemInfo,
        ] {
            let parsed: Capability = capability.as_str().parse().unwrap();
            assert_eq!(parsed, capability);
        }
        assert!(Capability::from_str("shell").is_err());
    }
}
