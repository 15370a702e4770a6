use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::config::MalwarePolicy;
use crate::{Error, Result};

/// Run artifacts directory under the local root.
pub const STATE_DIR: &str = ".portal";
/// Subtree holding isolated archives.
pub const RISK_DIR: &str = "_risk_tools";
/// Exclude-list entry that keeps isolated archives out of every transfer.
pub const RISK_EXCLUDE_ENTRY: &str = "_risk_tools/**";
const LEGACY_ISOLATION_DIR: &str = "_shield_isolated";

pub const MANIFEST_FILE: &str = "manifest.txt";
pub const PRIORITIZED_LIST_FILE: &str = "prioritized_risky.txt";
pub const STANDARD_LIST_FILE: &str = "standard_missing.txt";
pub const UPSYNC_MANIFEST_FILE: &str = "upsync-manifest.txt";
pub const EXCLUDE_FILE: &str = "exclude.txt";

/// One relative path per line; blank lines and `#` comments are ignored.
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Reads the exclude list. A missing file is an empty list.
pub fn read_exclude_list(path: &Path) -> Result<HashSet<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e.into()),
    }
}

/// Recursive listing of regular files as `/`-separated paths relative to `root`.
/// Skips the state directory and isolated-risk subtrees. A missing root lists nothing.
pub fn list_local_files(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            name != STATE_DIR && name != RISK_DIR && name != LEGACY_ISOLATION_DIR
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::InvalidConfig {
                message: format!("walkdir strip_prefix failed: {e}"),
            })?;
        let mut parts = Vec::new();
        for c in rel.components() {
            let s = c.as_os_str().to_str().ok_or_else(|| Error::NonUtf8Path {
                path: entry.path().to_path_buf(),
            })?;
            parts.push(s);
        }
        files.push(parts.join("/"));
    }

    files.sort();
    Ok(files)
}

/// Manifest reconciled against the local tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub remote_files: Vec<String>,
    pub local_count: u64,
    /// Manifest entries with no local file, in manifest order.
    pub missing: Vec<String>,
}

pub fn diff_manifest(remote_files: Vec<String>, local_files: &[String]) -> ManifestDiff {
    let local: HashSet<&str> = local_files.iter().map(String::as_str).collect();
    let missing = remote_files
        .iter()
        .filter(|f| !local.contains(f.as_str()))
        .cloned()
        .collect();
    ManifestDiff {
        remote_files,
        local_count: local_files.len() as u64,
        missing,
    }
}

/// Missing files split into the prioritized risky batch and the standard batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingSplit {
    pub risky: Vec<String>,
    pub standard: Vec<String>,
    /// Missing count after dropping excluded paths.
    pub missing_total: u64,
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Drops excluded paths, then routes each file by case-insensitive basename match
/// against `risky_names`.
pub fn split_missing<'a, I>(
    missing: &[String],
    exclude: &HashSet<String>,
    risky_names: I,
) -> MissingSplit
where
    I: IntoIterator<Item = &'a str>,
{
    let risky_names: HashSet<String> = risky_names.into_iter().map(str::to_lowercase).collect();

    let mut split = MissingSplit::default();
    for path in missing.iter().filter(|p| !exclude.contains(p.as_str())) {
        split.missing_total += 1;
        if risky_names.contains(&basename(path).to_lowercase()) {
            split.risky.push(path.clone());
        } else {
            split.standard.push(path.clone());
        }
    }
    split
}

/// The list of files approved for upload after a manifest-based pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsyncManifest {
    pub generated_at: String,
    pub version: String,
    pub policy: MalwarePolicy,
    pub files: Vec<String>,
}

impl UpsyncManifest {
    pub fn new(mut files: Vec<String>, policy: MalwarePolicy) -> Self {
        files.sort();
        files.dedup();
        Self {
            generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            version: env!("CARGO_PKG_VERSION").to_string(),
            policy,
            files,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "# Generated: {}\n# Total files: {}\n# Shield version: {}\n# Policy: {}\n",
            self.generated_at,
            self.files.len(),
            self.version,
            self.policy.as_str()
        );
        for f in &self.files {
            out.push_str(f);
            out.push('\n');
        }
        out
    }

    /// Unknown headers are ignored; a missing policy header means purge.
    pub fn parse(content: &str) -> Self {
        let mut generated_at = String::new();
        let mut version = String::new();
        let mut policy = MalwarePolicy::Purge;
        let mut files = Vec::new();

        for line in content.lines().map(str::trim) {
            if let Some(header) = line.strip_prefix('#') {
                let header = header.trim();
                if let Some(v) = header.strip_prefix("Generated:") {
                    generated_at = v.trim().to_string();
                } else if let Some(v) = header.strip_prefix("Shield version:") {
                    version = v.trim().to_string();
                } else if let Some(v) = header.strip_prefix("Policy:") {
                    if v.trim().eq_ignore_ascii_case("isolate") {
                        policy = MalwarePolicy::Isolate;
                    }
                }
                continue;
            }
            if !line.is_empty() {
                files.push(line.to_string());
            }
        }

        files.sort();
        Self {
            generated_at,
            version,
            policy,
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_ignores_comments_and_blank_lines() {
        let files = parse_manifest("# header\n\n a/b.zip \r\nc.pdf\n#x\n");
        assert_eq!(files, vec!["a/b.zip", "c.pdf"]);
    }

    #[test]
    fn local_listing_skips_state_and_risk_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("boards/gpu")).unwrap();
        std::fs::create_dir_all(root.join(STATE_DIR)).unwrap();
        std::fs::create_dir_all(root.join(RISK_DIR)).unwrap();
        std::fs::write(root.join("boards/gpu/a.zip"), b"a").unwrap();
        std::fs::write(root.join("top.pdf"), b"t").unwrap();
        std::fs::write(root.join(STATE_DIR).join(MANIFEST_FILE), b"m").unwrap();
        std::fs::write(root.join(RISK_DIR).join("bad.zip"), b"b").unwrap();

        let files = list_local_files(root).unwrap();
        assert_eq!(files, vec!["boards/gpu/a.zip", "top.pdf"]);
    }

    #[test]
    fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_local_files(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn diff_and_split_route_risky_names_case_insensitively() {
        let diff = diff_manifest(
            vec![
                "a.pdf".to_string(),
                "x/BIOS_U310 U410_chinafix.zip".to_string(),
                "b.pdf".to_string(),
                "gone.zip".to_string(),
            ],
            &["a.pdf".to_string()],
        );
        assert_eq!(diff.local_count, 1);
        assert_eq!(diff.missing.len(), 3);

        let exclude: HashSet<String> = ["gone.zip".to_string()].into_iter().collect();
        let split = split_missing(&diff.missing, &exclude, ["BIOS_u310 U410_Chinafix.zip"]);
        assert_eq!(split.risky, vec!["x/BIOS_U310 U410_chinafix.zip"]);
        assert_eq!(split.standard, vec!["b.pdf"]);
        assert_eq!(split.missing_total, 2);
    }

    #[test]
    fn exclude_list_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_exclude_list(&dir.path().join("exclude.txt")).unwrap().is_empty());
    }

    #[test]
    fn upsync_manifest_headers_parse_back() {
        let manifest = UpsyncManifest::new(
            vec!["b.pdf".to_string(), "a.zip".to_string(), "a.zip".to_string()],
            MalwarePolicy::Isolate,
        );
        let text = manifest.render();
        assert!(text.starts_with("# Generated: "));
        assert!(text.contains("# Total files: 2\n"));

        let parsed = UpsyncManifest::parse(&text);
        assert_eq!(parsed.files, vec!["a.zip", "b.pdf"]);
        assert_eq!(parsed.policy, MalwarePolicy::Isolate);
        assert_eq!(parsed.version, env!("CARGO_PKG_VERSION"));
    }
}
