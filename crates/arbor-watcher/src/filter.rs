//! Ignore rules and the initial repository scan

use std::path::{Component, Path};

use anyhow::{Context, Result};
use arbor_core::RawChange;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info};

/// Glob patterns matched against repository-relative paths with `/` separators.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreRules {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).with_context(|| format!("invalid ignore pattern {:?}", pattern))?;
            builder.add(glob);
        }
        Ok(IgnoreRules {
            patterns: patterns.to_vec(),
            set: builder.build()?,
        })
    }

    pub fn empty() -> Self {
        IgnoreRules {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_ignored(&self, relative: &str) -> bool {
        self.set.is_match(relative)
    }

    /// A directory is ignored when everything beneath it would be.
    pub fn is_ignored_dir(&self, relative: &str) -> bool {
        self.set.is_match(relative) || self.set.is_match(format!("{}/", relative.trim_end_matches('/')))
    }
}

/// `path` relative to `root`, joined with `/`. `None` outside the root.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Walk `root` and turn every readable text file into an `add` change.
/// Entries are visited in name order so repeated scans seed identically.
pub fn scan_repository(root: &Path, rules: &IgnoreRules) -> Result<Vec<RawChange>> {
    let mut changes = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        // Reverse so the stack pops subdirectories in name order.
        for entry in entries.into_iter().rev() {
            let path = entry.path();
            let Some(relative) = relative_path(root, &path) else {
                continue;
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if rules.is_ignored_dir(&relative) {
                    debug!("Skipping ignored directory {}", relative);
                } else {
                    pending.push(path);
                }
            } else if file_type.is_file() && !rules.is_ignored(&relative) {
                match std::fs::read_to_string(&path) {
                    Ok(content) => changes.push(RawChange::new("add", relative, Some(content))),
                    Err(e) => debug!("Skipping unreadable file {}: {}", relative, e),
                }
            }
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    info!("Scanned {} files under {}", changes.len(), root.display());
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::config::IngestConfig;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::new(&IngestConfig::default().ignore).unwrap();

        assert!(rules.is_ignored("node_modules/left-pad/index.js"));
        assert!(rules.is_ignored("web/node_modules/x.js"));
        assert!(rules.is_ignored(".git/HEAD"));
        assert!(rules.is_ignored("build.log"));
        assert!(rules.is_ignored("logs/server.log"));
        assert!(!rules.is_ignored("src/main.rs"));

        assert!(rules.is_ignored_dir("node_modules"));
        assert!(rules.is_ignored_dir("crates/app/target"));
        assert!(!rules.is_ignored_dir("src"));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(IgnoreRules::new(&["a[".to_string()]).is_err());
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, &root.join("src").join("lib.rs")).as_deref(),
            Some("src/lib.rs")
        );
        assert_eq!(relative_path(root, root), None);
        assert_eq!(relative_path(root, Path::new("/elsewhere/x.rs")), None);
    }
}
