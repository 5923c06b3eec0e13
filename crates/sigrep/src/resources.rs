//! Resource-sealing defaults and the adjustment builder.
//!
//! Bundle-shaped code seals the files around its executable. This module
//! carries the default rule set a representation recommends and the builder
//! object a representation adjusts before the sealing subsystem runs.

use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use walkdir::WalkDir;

use crate::Result;

/// Default resource-sealing rules, as a pair of weighted pattern
/// dictionaries (legacy `rules` and modern `rules2`).
#[derive(Debug, Clone)]
pub struct ResourceRules {
    rules: Dictionary,
    rules2: Dictionary,
}

impl ResourceRules {
    /// The standard rule set for bundle-shaped code.
    pub fn standard() -> Self {
        Self {
            rules: standard_rules(),
            rules2: standard_rules2(),
        }
    }

    pub fn rules(&self) -> &Dictionary {
        &self.rules
    }

    pub fn rules2(&self) -> &Dictionary {
        &self.rules2
    }

    /// The combined plist form, with `rules` and `rules2` top-level keys.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("rules".to_string(), Value::Dictionary(self.rules.clone()));
        dict.insert("rules2".to_string(), Value::Dictionary(self.rules2.clone()));
        dict
    }
}

fn standard_rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".to_string(), Value::Boolean(true));

    let mut lproj = Dictionary::new();
    lproj.insert("optional".to_string(), Value::Boolean(true));
    lproj.insert("weight".to_string(), Value::Real(1000.0));
    rules.insert("^.*\\.lproj/".to_string(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".to_string(), Value::Boolean(true));
    locversion.insert("weight".to_string(), Value::Real(1100.0));
    rules.insert(
        "^.*\\.lproj/locversion.plist$".to_string(),
        Value::Dictionary(locversion),
    );

    rules.insert("^version.plist$".to_string(), Value::Boolean(true));
    rules
}

fn standard_rules2() -> Dictionary {
    let mut rules2 = Dictionary::new();
    rules2.insert("^.*".to_string(), Value::Boolean(true));

    let mut ds_store = Dictionary::new();
    ds_store.insert("omit".to_string(), Value::Boolean(true));
    ds_store.insert("weight".to_string(), Value::Real(2000.0));
    rules2.insert("^(.*/)?\\.DS_Store$".to_string(), Value::Dictionary(ds_store));

    let mut lproj = Dictionary::new();
    lproj.insert("optional".to_string(), Value::Boolean(true));
    lproj.insert("weight".to_string(), Value::Real(1000.0));
    rules2.insert("^.*\\.lproj/".to_string(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".to_string(), Value::Boolean(true));
    locversion.insert("weight".to_string(), Value::Real(1100.0));
    rules2.insert(
        "^.*\\.lproj/locversion.plist$".to_string(),
        Value::Dictionary(locversion),
    );

    let mut info_plist = Dictionary::new();
    info_plist.insert("omit".to_string(), Value::Boolean(true));
    info_plist.insert("weight".to_string(), Value::Real(20.0));
    rules2.insert("^Info\\.plist$".to_string(), Value::Dictionary(info_plist));

    let mut version_plist = Dictionary::new();
    version_plist.insert("weight".to_string(), Value::Real(20.0));
    rules2.insert("^version\\.plist$".to_string(), Value::Dictionary(version_plist));

    rules2
}

/// Collects the inputs for a resource-sealing pass: the resource root plus
/// any paths the representation wants excluded from the seal.
///
/// Exclusions are bundle-relative path prefixes, matched per component.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    root: PathBuf,
    exclusions: Vec<String>,
}

impl ResourceBuilder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            exclusions: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclude a bundle-relative path (or directory prefix) from sealing.
    pub fn exclude(&mut self, relative: impl Into<String>) {
        self.exclusions.push(relative.into());
    }

    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    /// Whether a bundle-relative path falls under any exclusion.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.exclusions.iter().any(|ex| {
            relative == ex
                || relative
                    .strip_prefix(ex.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Enumerate sealable files under the root, honoring exclusions.
    /// Paths are returned bundle-relative, in walk order.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            let key = relative.to_string_lossy();
            if !self.is_excluded(&key) {
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_standard_rules_shape() {
        let rules = ResourceRules::standard();
        assert!(rules.rules().contains_key("^.*"));
        assert!(rules.rules2().contains_key("^(.*/)?\\.DS_Store$"));
        let combined = rules.to_dictionary();
        assert!(combined.contains_key("rules"));
        assert!(combined.contains_key("rules2"));
    }

    #[test]
    fn test_exclusion_matching() {
        let mut builder = ResourceBuilder::new("/tmp/x");
        builder.exclude("_CodeSignature");
        builder.exclude("Contents/MacOS/app");
        assert!(builder.is_excluded("_CodeSignature"));
        assert!(builder.is_excluded("_CodeSignature/CodeResources"));
        assert!(builder.is_excluded("Contents/MacOS/app"));
        assert!(!builder.is_excluded("_CodeSignatureX"));
        assert!(!builder.is_excluded("Contents/MacOS/app2"));
    }

    #[test]
    fn test_scan_honors_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("_CodeSignature")).unwrap();
        fs::write(dir.path().join("_CodeSignature/CodeResources"), b"seal").unwrap();
        fs::write(dir.path().join("data.txt"), b"data").unwrap();

        let mut builder = ResourceBuilder::new(dir.path());
        builder.exclude("_CodeSignature");
        let files = builder.scan().unwrap();
        assert_eq!(files, vec![PathBuf::from("data.txt")]);
    }
}
