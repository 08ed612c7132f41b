use std::path::Path;

use serde::Serialize;

use crate::config::UploadConfig;

pub const TEAM_NAMESPACE: &str = "Team";

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
];

/// What a build artifact is, selected once from its extension.
///
/// Variant order is upload order: resources first so that pages referencing
/// them are written last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Image,
    Other,
    Css,
    Js,
    Html,
}

impl ContentKind {
    pub fn from_path(path: &str) -> Self {
        match extension(path).as_deref() {
            Some("html" | "htm") => Self::Html,
            Some("css") => Self::Css,
            Some("js" | "mjs") => Self::Js,
            Some(ext) if IMAGE_TYPES.iter().any(|(known, _)| *known == ext) => Self::Image,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Other => "other",
            Self::Css => "css",
            Self::Js => "js",
            Self::Html => "html",
        }
    }

    /// Text kinds are stored as page text; the rest upload as files.
    pub fn is_text(self) -> bool {
        matches!(self, Self::Html | Self::Css | Self::Js)
    }
}

/// Map a file extension to the content type the wiki serves it with.
pub fn mime_type_for(path: &str) -> &'static str {
    let Some(ext) = extension(path) else {
        return "text/plain";
    };
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        other => IMAGE_TYPES
            .iter()
            .find(|(known, _)| *known == other)
            .map(|(_, mime)| *mime)
            .unwrap_or("text/plain"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingConfig {
    pub team: Option<String>,
    pub prefix: Option<String>,
    pub no_index: bool,
}

impl NamingConfig {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            team: config.team(),
            prefix: config
                .upload
                .prefix
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            no_index: config.upload.no_index,
        }
    }

    /// `Team:<team>` followed by the optional prefix. `prefix` is always appended after the team.
    pub fn title_prefix(&self) -> String {
        let team = self
            .team
            .as_deref()
            .map(|team| team.trim().trim_matches('/'))
            .filter(|team| !team.is_empty())
            .map(|team| {
                if team.starts_with(&format!("{TEAM_NAMESPACE}:")) {
                    team.to_string()
                } else {
                    format!("{TEAM_NAMESPACE}:{team}")
                }
            });
        let prefix = self
            .prefix
            .as_deref()
            .map(|prefix| prefix.trim().trim_matches('/'))
            .filter(|prefix| !prefix.is_empty());
        match (team, prefix) {
            (Some(team), Some(prefix)) => format!("{team}/{prefix}"),
            (Some(team), None) => team,
            (None, Some(prefix)) => prefix.to_string(),
            (None, None) => String::new(),
        }
    }

    /// Prefix a bare title, leaving titles that already carry the prefix alone.
    pub fn prefix_title(&self, title: &str) -> String {
        let base = self.title_prefix();
        let title = title.trim_matches('/');
        if base.is_empty() {
            return if title.is_empty() {
                "index".to_string()
            } else {
                title.to_string()
            };
        }
        if title == base || title.starts_with(&format!("{base}/")) {
            return title.to_string();
        }
        if title.is_empty() {
            base
        } else {
            format!("{base}/{title}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// Build-root-relative path with `/` separators; the key used for cross references.
    pub relative_path: String,
    pub remote_page_name: String,
    pub kind: ContentKind,
    pub mime_type: &'static str,
}

/// Map a build output file to its remote page. Total: every path gets a name.
pub fn resolve(local_path: &Path, build_root: &Path, naming: &NamingConfig) -> ResolvedName {
    let relative = local_path.strip_prefix(build_root).unwrap_or(local_path);
    let relative_path = normalize_relative(&relative.to_string_lossy());
    let kind = ContentKind::from_path(&relative_path);

    let stem = if naming.no_index && kind == ContentKind::Html && is_index_page(&relative_path) {
        parent_of(&relative_path).to_string()
    } else if kind.is_text() {
        strip_extension(&relative_path).to_string()
    } else {
        relative_path.clone()
    };

    ResolvedName {
        remote_page_name: naming.prefix_title(&stem),
        mime_type: mime_type_for(&relative_path),
        kind,
        relative_path,
    }
}

/// Collapse separators, `.` and `..` segments into a root-relative key.
pub fn normalize_relative(path: &str) -> String {
    let normalized = normalize_separators(path);
    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn parent_of(relative_path: &str) -> &str {
    relative_path
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or("")
}

fn is_index_page(relative_path: &str) -> bool {
    let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    matches!(file_name.to_ascii_lowercase().as_str(), "index.html" | "index.htm")
}

fn strip_extension(relative_path: &str) -> &str {
    let file_start = relative_path.rfind('/').map(|index| index + 1).unwrap_or(0);
    match relative_path[file_start..].rfind('.') {
        Some(dot) if dot > 0 => &relative_path[..file_start + dot],
        _ => relative_path,
    }
}

fn extension(path: &str) -> Option<String> {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ContentKind, NamingConfig, mime_type_for, normalize_relative, resolve};

    fn naming(team: Option<&str>, prefix: Option<&str>, no_index: bool) -> NamingConfig {
        NamingConfig {
            team: team.map(ToString::to_string),
            prefix: prefix.map(ToString::to_string),
            no_index,
        }
    }

    #[test]
    fn resolves_text_pages_without_extension() {
        let naming = naming(Some("Amsterdam"), None, false);
        let root = Path::new("/build");
        let html = resolve(Path::new("/build/about.html"), root, &naming);
        assert_eq!(html.remote_page_name, "Team:Amsterdam/about");
        assert_eq!(html.kind, ContentKind::Html);
        assert_eq!(html.mime_type, "text/html");

        let css = resolve(Path::new("/build/css/style.css"), root, &naming);
        assert_eq!(css.remote_page_name, "Team:Amsterdam/css/style");
        assert_eq!(css.relative_path, "css/style.css");
        assert_eq!(css.mime_type, "text/css");

        let js = resolve(Path::new("/build/app.js"), root, &naming);
        assert_eq!(js.remote_page_name, "Team:Amsterdam/app");
        assert_eq!(js.mime_type, "text/javascript");
    }

    #[test]
    fn resources_keep_their_extension() {
        let naming = naming(Some("Amsterdam"), None, false);
        let logo = resolve(Path::new("/build/img/logo.png"), Path::new("/build"), &naming);
        assert_eq!(logo.remote_page_name, "Team:Amsterdam/img/logo.png");
        assert_eq!(logo.kind, ContentKind::Image);
        assert_eq!(logo.mime_type, "image/png");
    }

    #[test]
    fn no_index_collapses_folder_index_pages() {
        let naming = naming(Some("team"), None, true);
        let root = Path::new("/build");
        let nested = resolve(Path::new("/build/subpage/index.html"), root, &naming);
        assert_eq!(nested.remote_page_name, "Team:team/subpage");
        let top = resolve(Path::new("/build/index.html"), root, &naming);
        assert_eq!(top.remote_page_name, "Team:team");
    }

    #[test]
    fn index_pages_keep_suffix_without_no_index() {
        let naming = naming(Some("team"), None, false);
        let nested = resolve(Path::new("/build/subpage/index.html"), Path::new("/build"), &naming);
        assert_eq!(nested.remote_page_name, "Team:team/subpage/index");
    }

    #[test]
    fn prefix_is_appended_after_team() {
        let both = naming(Some("Team:Amsterdam/"), Some("/v2/"), false);
        let page = resolve(Path::new("/build/about.html"), Path::new("/build"), &both);
        assert_eq!(page.remote_page_name, "Team:Amsterdam/v2/about");

        let prefix_only = naming(None, Some("v2"), false);
        assert_eq!(prefix_only.prefix_title("about"), "v2/about");
    }

    #[test]
    fn prefix_title_does_not_double_prefix() {
        let naming = naming(Some("Amsterdam"), None, false);
        assert_eq!(
            naming.prefix_title("Team:Amsterdam/about"),
            "Team:Amsterdam/about"
        );
    }

    #[test]
    fn unknown_extensions_fall_back_to_plain_text() {
        assert_eq!(mime_type_for("data/table.csv"), "text/plain");
        assert_eq!(mime_type_for("LICENSE"), "text/plain");
        assert_eq!(mime_type_for(".htaccess"), "text/plain");
        assert_eq!(mime_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(ContentKind::from_path("fonts/a.woff2"), ContentKind::Other);
    }

    #[test]
    fn resolution_is_deterministic_for_windows_and_relative_paths() {
        let naming = naming(Some("Amsterdam"), None, false);
        let first = resolve(Path::new("css\\style.css"), Path::new("build"), &naming);
        let second = resolve(Path::new("./css/../css/style.css"), Path::new("build"), &naming);
        assert_eq!(first, second);
        assert_eq!(first.remote_page_name, "Team:Amsterdam/css/style");
    }

    #[test]
    fn normalize_relative_resolves_dot_segments() {
        assert_eq!(normalize_relative("./a/./b/../c.css"), "a/c.css");
        assert_eq!(normalize_relative("/img//logo.png"), "img/logo.png");
        assert_eq!(normalize_relative("../../x.js"), "x.js");
    }
}
