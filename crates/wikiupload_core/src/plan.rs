use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{DEFAULT_CONFIG_FILE, UploadConfig};
use crate::resolve::{ContentKind, NamingConfig, normalize_separators, resolve};
use crate::rewrite::{IndexEntry, Rewriter, TargetIndex};
use crate::session::{SessionClient, WikiApi};

const BYTE_ORDER_MARK: char = '\u{feff}';

/// File names never planned, wherever they sit under the build root.
const SECRET_FILE_NAMES: &[&str] = &[DEFAULT_CONFIG_FILE, ".env"];

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripPolicy {
    pub enabled: bool,
    /// Literal boilerplate removed from text content wherever it occurs.
    pub markers: Vec<String>,
}

impl StripPolicy {
    pub fn apply(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut stripped = text
            .trim_start_matches(BYTE_ORDER_MARK)
            .trim_start()
            .to_string();
        for marker in self.markers.iter().filter(|marker| !marker.is_empty()) {
            stripped = stripped.replace(marker.as_str(), "");
        }
        stripped
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Globs matched against build-root-relative paths. Empty means everything.
    pub include: Vec<String>,
    pub ignore: Vec<String>,
    pub strip: StripPolicy,
    pub naming: NamingConfig,
    /// Wiki base URL used in rewritten references.
    pub remote_base: String,
    /// Files never planned even when a glob matches them, such as the loaded config.
    pub protected: Vec<PathBuf>,
}

impl PlanOptions {
    pub fn from_config(config: &UploadConfig, remote_base: &str) -> Self {
        Self {
            include: config.upload.include.clone(),
            ignore: config.upload.ignore.clone(),
            strip: StripPolicy {
                enabled: config.upload.strip,
                markers: config.upload.strip_markers.clone(),
            },
            naming: NamingConfig::from_config(config),
            remote_base: remote_base.to_string(),
            protected: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub local_path: PathBuf,
    pub relative_path: String,
    pub remote_page_name: String,
    pub content_kind: ContentKind,
    pub mime_type: &'static str,
    /// Final content: stripped and rewritten for text kinds.
    pub payload: Payload,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub targets: Vec<UploadTarget>,
    pub index: TargetIndex,
    pub excluded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Write,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    pub target: UploadTarget,
    pub action: PlanAction,
}

/// Build the ordered upload plan for everything under `build_root`.
///
/// The first pass discovers and names every target without touching the remote.
/// The second pass rewrites text content against the completed index, so the
/// result does not depend on discovery order.
pub fn plan(build_root: &Path, options: &PlanOptions) -> Result<UploadPlan> {
    if !build_root.is_dir() {
        bail!("build root {} is not a directory", build_root.display());
    }
    let include = compile_patterns(&options.include, "include")?;
    let ignore = compile_patterns(&options.ignore, "ignore")?;
    let protected: Vec<PathBuf> = options
        .protected
        .iter()
        .map(|path| fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
        .collect();

    let mut discovered = Vec::new();
    let mut excluded = 0usize;
    for entry in WalkDir::new(build_root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", build_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = resolve(path, build_root, &options.naming);
        if is_secret(&name.relative_path, &include) || is_protected(path, &protected) {
            debug!(path = %name.relative_path, "excluded as a hidden or secret file");
            excluded += 1;
            continue;
        }
        if !is_included(&name.relative_path, &include, &ignore) {
            debug!(path = %name.relative_path, "excluded by include/ignore rules");
            excluded += 1;
            continue;
        }
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        discovered.push((path.to_path_buf(), name, bytes));
    }
    discovered.sort_by(|(_, left, _), (_, right, _)| {
        (left.kind, &left.relative_path).cmp(&(right.kind, &right.relative_path))
    });

    let mut index = TargetIndex::new();
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for (_, name, _) in &discovered {
        if let Some(previous) = owners.insert(name.remote_page_name.clone(), name.relative_path.clone())
        {
            warn!(
                page = %name.remote_page_name,
                first = %previous,
                second = %name.relative_path,
                "two files resolve to the same page; the later one wins"
            );
        }
        index.insert(
            &name.relative_path,
            IndexEntry {
                remote_page_name: name.remote_page_name.clone(),
                kind: name.kind,
                mime_type: name.mime_type,
            },
        );
    }

    let rewriter = Rewriter::new(&index, &options.remote_base);
    let mut targets = Vec::with_capacity(discovered.len());
    for (local_path, name, bytes) in discovered {
        let (payload, unresolved) = if name.kind.is_text() {
            let text = decode_text(&local_path, bytes);
            let text = options.strip.apply(&text);
            let rewrite = rewriter.rewrite(&name.relative_path, &text, name.kind);
            (Payload::Text(rewrite.content), rewrite.unresolved)
        } else {
            (Payload::Binary(bytes), Vec::new())
        };
        targets.push(UploadTarget {
            local_path,
            relative_path: name.relative_path,
            remote_page_name: name.remote_page_name,
            content_kind: name.kind,
            mime_type: name.mime_type,
            payload,
            unresolved,
        });
    }

    info!(targets = targets.len(), excluded, "planned upload");
    Ok(UploadPlan {
        targets,
        index,
        excluded,
    })
}

/// Schedule every target for writing.
pub fn schedule_all(targets: Vec<UploadTarget>) -> Vec<PlannedUpload> {
    targets
        .into_iter()
        .map(|target| PlannedUpload {
            target,
            action: PlanAction::Write,
        })
        .collect()
}

/// Skip targets whose remote content already matches. A failed read schedules the write.
pub fn mark_unchanged<A: WikiApi>(
    client: &SessionClient<A>,
    targets: Vec<UploadTarget>,
) -> Vec<PlannedUpload> {
    targets
        .into_iter()
        .map(|target| {
            let action = match client.read_page(&target.remote_page_name, target.content_kind) {
                Ok(Some(remote)) if is_unchanged(&target, &remote) => {
                    debug!(page = %target.remote_page_name, "unchanged, skipping");
                    PlanAction::Skip
                }
                Ok(Some(remote)) => {
                    log_changes(&target, &remote);
                    PlanAction::Write
                }
                Ok(None) => {
                    debug!(page = %target.remote_page_name, "page does not exist yet");
                    PlanAction::Write
                }
                Err(error) => {
                    warn!(page = %target.remote_page_name, error = %error, "change check failed, uploading anyway");
                    PlanAction::Write
                }
            };
            PlannedUpload { target, action }
        })
        .collect()
}

/// Compare planned content with what the wiki stores. Text ignores trailing
/// whitespace, which the wiki trims on save.
pub fn is_unchanged(target: &UploadTarget, remote: &[u8]) -> bool {
    match &target.payload {
        Payload::Text(local) => {
            let remote = String::from_utf8_lossy(remote);
            content_digest(local.trim_end().as_bytes()) == content_digest(remote.trim_end().as_bytes())
        }
        Payload::Binary(local) => content_digest(local) == content_digest(remote),
    }
}

pub fn content_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn log_changes(target: &UploadTarget, remote: &[u8]) {
    let Payload::Text(local) = &target.payload else {
        debug!(page = %target.remote_page_name, bytes = target.payload.len(), "binary content changed");
        return;
    };
    let remote = String::from_utf8_lossy(remote);
    let diff = TextDiff::from_lines(remote.as_ref(), local.as_str());
    let changed = diff
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .count();
    debug!(page = %target.remote_page_name, changed_lines = changed, "content changed");
}

fn decode_text(path: &Path, bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(error) => {
            warn!(path = %path.display(), "text file is not valid UTF-8, replacing invalid bytes");
            String::from_utf8_lossy(error.as_bytes()).into_owned()
        }
    }
}

fn compile_patterns(patterns: &[String], what: &str) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = normalize_separators(pattern.trim());
            let pattern = pattern.strip_prefix("./").unwrap_or(&pattern);
            Pattern::new(pattern).with_context(|| format!("invalid {what} glob `{pattern}`"))
        })
        .collect()
}

fn is_included(relative_path: &str, include: &[Pattern], ignore: &[Pattern]) -> bool {
    let matches = |pattern: &Pattern| pattern.matches_with(relative_path, GLOB_OPTIONS);
    let included = include.is_empty() || include.iter().any(matches);
    included && !ignore.iter().any(matches)
}

/// Config and env files are always secret. Any other path with a dot segment
/// is secret unless an include glob names a dot segment and matches it.
fn is_secret(relative_path: &str, include: &[Pattern]) -> bool {
    let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    if SECRET_FILE_NAMES.contains(&file_name) {
        return true;
    }
    if !relative_path.split('/').any(|segment| segment.starts_with('.')) {
        return false;
    }
    !include.iter().any(|pattern| {
        pattern.as_str().split('/').any(|segment| segment.starts_with('.'))
            && pattern.matches_with(relative_path, GLOB_OPTIONS)
    })
}

fn is_protected(path: &Path, protected: &[PathBuf]) -> bool {
    if protected.is_empty() {
        return false;
    }
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    protected.contains(&path)
}
