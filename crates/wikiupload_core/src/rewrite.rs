//! Rewrites references between co-uploaded build artifacts into wiki URLs.
//!
//! Stylesheets, scripts and resources are served through the raw-fetch form
//! `<base>/<page>?action=raw&ctype=<mime>` so the wiki returns the stored bytes
//! with the right content type. Links between HTML pages point at the rendered
//! page instead. References that do not match a target are left untouched.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::resolve::{ContentKind, normalize_relative, parent_of};

const RAW_MARKER: &str = "action=raw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub remote_page_name: String,
    pub kind: ContentKind,
    pub mime_type: &'static str,
}

/// Every planned target keyed by build-root-relative path. Built once, read-only after.
#[derive(Debug, Clone, Default)]
pub struct TargetIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl TargetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relative_path: &str, entry: IndexEntry) {
        self.entries.insert(normalize_relative(relative_path), entry);
    }

    pub fn get(&self, relative_path: &str) -> Option<&IndexEntry> {
        self.entries.get(&normalize_relative(relative_path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewrite {
    pub content: String,
    pub rewritten: usize,
    /// Local-looking references with no matching target, in document order.
    pub unresolved: Vec<String>,
}

pub fn raw_fetch_url(remote_base: &str, remote_page_name: &str, mime_type: &str) -> String {
    format!(
        "{}?{RAW_MARKER}&ctype={mime_type}",
        page_url(remote_base, remote_page_name)
    )
}

/// Link to a page. Spaces become `_` and anything the wiki would not leave
/// literal in a title URL is percent-encoded.
pub fn page_url(remote_base: &str, remote_page_name: &str) -> String {
    format!(
        "{}/{}",
        remote_base.trim_end_matches('/'),
        encode_title(remote_page_name)
    )
}

fn encode_title(title: &str) -> String {
    let mut encoded = String::with_capacity(title.len());
    for byte in title.replace(' ', "_").bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~/:;@$!*(),".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

pub struct Rewriter<'a> {
    index: &'a TargetIndex,
    remote_base: String,
}

#[derive(Default)]
struct Tally {
    rewritten: usize,
    unresolved: Vec<String>,
}

impl<'a> Rewriter<'a> {
    pub fn new(index: &'a TargetIndex, remote_base: &str) -> Self {
        Self {
            index,
            remote_base: remote_base.trim_end_matches('/').to_string(),
        }
    }

    /// Rewrite `content` of the artifact at `source_path`. Applying it twice is a no-op.
    pub fn rewrite(&self, source_path: &str, content: &str, kind: ContentKind) -> Rewrite {
        let source_dir = parent_of(&normalize_relative(source_path)).to_string();
        let mut tally = Tally::default();
        let content = match kind {
            ContentKind::Html => self.rewrite_html(&source_dir, content, &mut tally),
            ContentKind::Css => self.rewrite_css(&source_dir, content, &mut tally),
            ContentKind::Js | ContentKind::Image | ContentKind::Other => content.to_string(),
        };
        for reference in &tally.unresolved {
            warn!(path = source_path, reference = %reference, "unresolved asset reference left as-is");
        }
        if tally.rewritten > 0 {
            debug!(path = source_path, count = tally.rewritten, "rewrote asset references");
        }
        Rewrite {
            content,
            rewritten: tally.rewritten,
            unresolved: tally.unresolved,
        }
    }

    fn rewrite_html(&self, source_dir: &str, content: &str, tally: &mut Tally) -> String {
        html_segment_regex()
            .replace_all(content, |caps: &Captures<'_>| {
                if caps.name("comment").is_some() {
                    return caps[0].to_string();
                }
                if let (Some(open), Some(body), Some(close)) = (
                    caps.name("script_open"),
                    caps.name("script_body"),
                    caps.name("script_close"),
                ) {
                    let open = self.rewrite_tag(source_dir, open.as_str(), tally);
                    return format!("{open}{}{}", body.as_str(), close.as_str());
                }
                if let (Some(open), Some(body), Some(close)) = (
                    caps.name("style_open"),
                    caps.name("style_body"),
                    caps.name("style_close"),
                ) {
                    let open = self.rewrite_tag(source_dir, open.as_str(), tally);
                    let body = self.rewrite_css(source_dir, body.as_str(), tally);
                    return format!("{open}{body}{}", close.as_str());
                }
                self.rewrite_tag(source_dir, &caps[0], tally)
            })
            .into_owned()
    }

    /// Attributes are matched one after another, so an attribute name inside
    /// another attribute's value is never mistaken for a real one.
    fn rewrite_tag(&self, source_dir: &str, tag: &str, tally: &mut Tally) -> String {
        attribute_regex()
            .replace_all(tag, |caps: &Captures<'_>| {
                match caps["name"].to_ascii_lowercase().as_str() {
                    "href" | "src" | "poster" | "data-src" => replace_quoted(caps, "\"", |value| {
                        self.rewrite_reference(source_dir, value, tally)
                    }),
                    "style" => replace_quoted(caps, "\"", |value| {
                        let rewritten = self.rewrite_css(source_dir, value, tally);
                        (rewritten != value).then_some(rewritten)
                    }),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn rewrite_css(&self, source_dir: &str, content: &str, tally: &mut Tally) -> String {
        let content = css_url_regex().replace_all(content, |caps: &Captures<'_>| {
            replace_quoted(caps, "", |value| {
                self.rewrite_reference(source_dir, value, tally)
            })
        });
        css_import_regex()
            .replace_all(&content, |caps: &Captures<'_>| {
                replace_quoted(caps, "\"", |value| {
                    self.rewrite_reference(source_dir, value, tally)
                })
            })
            .into_owned()
    }

    fn rewrite_reference(&self, source_dir: &str, reference: &str, tally: &mut Tally) -> Option<String> {
        let trimmed = reference.trim();
        if !is_local_reference(trimmed) {
            return None;
        }
        let (path, suffix) = split_reference(trimmed);
        let Some(entry) = self.lookup(source_dir, path) else {
            tally.unresolved.push(reference.to_string());
            return None;
        };
        tally.rewritten += 1;
        Some(self.remote_url(entry, suffix))
    }

    fn lookup(&self, source_dir: &str, path: &str) -> Option<&IndexEntry> {
        let key = if path.starts_with('/') {
            normalize_relative(path)
        } else {
            normalize_relative(&format!("{source_dir}/{path}"))
        };
        if let Some(entry) = self.index.get(&key) {
            return Some(entry);
        }
        let index_page = if key.is_empty() {
            "index.html".to_string()
        } else {
            format!("{key}/index.html")
        };
        self.index
            .get(&index_page)
            .or_else(|| self.index.get(&format!("{key}.html")))
    }

    fn remote_url(&self, entry: &IndexEntry, suffix: &str) -> String {
        if entry.kind == ContentKind::Html {
            return format!("{}{suffix}", page_url(&self.remote_base, &entry.remote_page_name));
        }
        let raw = raw_fetch_url(&self.remote_base, &entry.remote_page_name, entry.mime_type);
        match suffix.strip_prefix('?') {
            Some("") => raw,
            Some(query) => format!("{raw}&{query}"),
            None => format!("{raw}{suffix}"),
        }
    }
}

/// Rebuild a `lead + quoted value + trail` match, keeping the original quote style.
fn replace_quoted<F>(caps: &Captures<'_>, bare_quote: &str, map: F) -> String
where
    F: FnOnce(&str) -> Option<String>,
{
    let (quote, value) = if let Some(value) = caps.name("dq") {
        ("\"", value.as_str())
    } else if let Some(value) = caps.name("sq") {
        ("'", value.as_str())
    } else {
        (bare_quote, caps.name("bare").map_or("", |value| value.as_str()))
    };
    match map(value) {
        Some(replacement) => format!(
            "{}{quote}{replacement}{quote}{}",
            &caps["lead"],
            caps.name("trail").map_or("", |trail| trail.as_str())
        ),
        None => caps[0].to_string(),
    }
}

/// Relative or root-relative paths into the build tree. Schemes, protocol-relative
/// URLs, fragments and wiki titles (anything with `:`) are not.
fn is_local_reference(reference: &str) -> bool {
    if reference.is_empty() || reference.starts_with('#') || reference.starts_with("//") {
        return false;
    }
    if reference.contains(RAW_MARKER) {
        return false;
    }
    let (path, _) = split_reference(reference);
    !path.is_empty() && !path.contains(':')
}

fn split_reference(reference: &str) -> (&str, &str) {
    match reference.find(['?', '#']) {
        Some(index) => reference.split_at(index),
        None => (reference, ""),
    }
}

fn html_segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)(?P<comment><!--.*?-->)|(?P<script_open><script\b[^>]*>)(?P<script_body>.*?)(?P<script_close></script\s*>)|(?P<style_open><style\b[^>]*>)(?P<style_body>.*?)(?P<style_close></style\s*>)|<[a-z][^>]*>",
        )
        .expect("valid regex")
    })
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?P<lead>\s(?P<name>[^\s"'<>/=]+)\s*=\s*)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<bare>[^\s"'=<>`]+))"#,
        )
        .expect("valid regex")
    })
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?P<lead>url\(\s*)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<bare>[^"'()\s]+))(?P<trail>\s*\))"#,
        )
        .expect("valid regex")
    })
}

fn css_import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?P<lead>@import\s+)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#)
            .expect("valid regex")
    })
}

#[cfg(test)]
mod tests {
    use super::{IndexEntry, Rewriter, TargetIndex, page_url, raw_fetch_url};
    use crate::resolve::ContentKind;

    const BASE: &str = "https://2017.igem.org";

    fn index() -> TargetIndex {
        let mut index = TargetIndex::new();
        for (path, page, kind, mime) in [
            ("index.html", "Team:Amsterdam", ContentKind::Html, "text/html"),
            ("about/index.html", "Team:Amsterdam/about", ContentKind::Html, "text/html"),
            ("style.css", "Team:Amsterdam/style", ContentKind::Css, "text/css"),
            ("js/app.js", "Team:Amsterdam/js/app", ContentKind::Js, "text/javascript"),
            ("logo.png", "Team:Amsterdam/logo.png", ContentKind::Image, "image/png"),
            ("img/bg.jpg", "Team:Amsterdam/img/bg.jpg", ContentKind::Image, "image/jpeg"),
        ] {
            index.insert(
                path,
                IndexEntry {
                    remote_page_name: page.to_string(),
                    kind,
                    mime_type: mime,
                },
            );
        }
        index
    }

    #[test]
    fn html_references_become_raw_fetch_urls() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = r#"<link rel="stylesheet" href="style.css"><img src='logo.png'><script src="js/app.js"></script>"#;
        let result = rewriter.rewrite("index.html", html, ContentKind::Html);

        assert_eq!(
            result.content,
            concat!(
                r#"<link rel="stylesheet" href="https://2017.igem.org/Team:Amsterdam/style?action=raw&ctype=text/css">"#,
                r#"<img src='https://2017.igem.org/Team:Amsterdam/logo.png?action=raw&ctype=image/png'>"#,
                r#"<script src="https://2017.igem.org/Team:Amsterdam/js/app?action=raw&ctype=text/javascript"></script>"#,
            )
        );
        assert_eq!(result.rewritten, 3);
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn rewriting_is_idempotent() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = r#"<a href=about/>About</a><div style="background:url(img/bg.jpg)"></div><link href="/style.css?v=3">"#;
        let once = rewriter.rewrite("index.html", html, ContentKind::Html);
        let twice = rewriter.rewrite("index.html", &once.content, ContentKind::Html);
        assert_eq!(once.content, twice.content);
        assert_eq!(twice.rewritten, 0);
        assert!(twice.unresolved.is_empty());
    }

    #[test]
    fn idempotent_without_remote_base() {
        let index = index();
        let rewriter = Rewriter::new(&index, "");
        let html = r#"<a href="about/index.html">About</a><img src="logo.png">"#;
        let once = rewriter.rewrite("index.html", html, ContentKind::Html);
        assert!(once.content.contains(r#"href="/Team:Amsterdam/about""#));
        let twice = rewriter.rewrite("index.html", &once.content, ContentKind::Html);
        assert_eq!(once.content, twice.content);
        assert!(twice.unresolved.is_empty());
    }

    #[test]
    fn unresolved_references_are_left_byte_identical() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = "<img src=\"missing.png\">\n<a href=\"https://example.org/x.css\">x</a>\n<a href=\"#top\">top</a>";
        let result = rewriter.rewrite("index.html", html, ContentKind::Html);
        assert_eq!(result.content, html);
        assert_eq!(result.unresolved, vec!["missing.png".to_string()]);
    }

    #[test]
    fn query_and_fragment_follow_injected_parameters() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = r#"<link href="style.css?v=2#main"><a href="about/#team">Team</a>"#;
        let result = rewriter.rewrite("index.html", html, ContentKind::Html);
        assert!(result.content.contains(
            r#"href="https://2017.igem.org/Team:Amsterdam/style?action=raw&ctype=text/css&v=2#main""#
        ));
        assert!(
            result
                .content
                .contains(r#"href="https://2017.igem.org/Team:Amsterdam/about#team""#)
        );
    }

    #[test]
    fn relative_and_absolute_paths_share_a_key() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let from_nested = rewriter.rewrite(
            "about/index.html",
            r#"<img src="../logo.png"><img src="/logo.png"><img src="./../logo.png">"#,
            ContentKind::Html,
        );
        let expected = raw_fetch_url(BASE, "Team:Amsterdam/logo.png", "image/png");
        assert_eq!(from_nested.content.matches(&expected).count(), 3);
    }

    #[test]
    fn css_urls_and_imports_are_rewritten() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let css = "@import \"../style.css\";\nbody { background: url( bg.jpg ); }\n.x { background: url('data:image/png;base64,AAA'); }";
        let result = rewriter.rewrite("img/theme.css", css, ContentKind::Css);
        assert_eq!(
            result.content,
            "@import \"https://2017.igem.org/Team:Amsterdam/style?action=raw&ctype=text/css\";\nbody { background: url( https://2017.igem.org/Team:Amsterdam/img/bg.jpg?action=raw&ctype=image/jpeg ); }\n.x { background: url('data:image/png;base64,AAA'); }"
        );
    }

    #[test]
    fn script_bodies_and_comments_are_untouched() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = "<!-- <img src=\"logo.png\"> --><script>var a = '<img src=\"logo.png\">';</script><style>h1{background:url(logo.png)}</style>";
        let result = rewriter.rewrite("index.html", html, ContentKind::Html);
        assert!(result.content.starts_with("<!-- <img src=\"logo.png\"> --><script>var a = '<img src=\"logo.png\">';</script>"));
        assert!(result.content.ends_with(
            "<style>h1{background:url(https://2017.igem.org/Team:Amsterdam/logo.png?action=raw&ctype=image/png)}</style>"
        ));
    }

    #[test]
    fn attribute_names_inside_other_values_are_ignored() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let html = r#"<img title="see src=logo.png" alt='href=style.css' data-note=src=logo.png>"#;
        let result = rewriter.rewrite("index.html", html, ContentKind::Html);
        assert_eq!(result.content, html);
        assert_eq!(result.rewritten, 0);

        let mixed = r#"<img title="see src=logo.png" src="logo.png">"#;
        let result = rewriter.rewrite("index.html", mixed, ContentKind::Html);
        assert_eq!(
            result.content,
            r#"<img title="see src=logo.png" src="https://2017.igem.org/Team:Amsterdam/logo.png?action=raw&ctype=image/png">"#
        );
    }

    #[test]
    fn page_names_are_percent_encoded() {
        assert_eq!(
            page_url(BASE, "Team:Amsterdam/a#b.png"),
            "https://2017.igem.org/Team:Amsterdam/a%23b.png"
        );
        assert_eq!(
            page_url(BASE, "Team:Amsterdam/Q&A page?"),
            "https://2017.igem.org/Team:Amsterdam/Q%26A_page%3F"
        );
        assert_eq!(
            page_url(BASE, "Team:Amsterdam/caf\u{e9}"),
            "https://2017.igem.org/Team:Amsterdam/caf%C3%A9"
        );
    }

    #[test]
    fn encoded_references_stay_idempotent() {
        let mut index = index();
        index.insert(
            "q&a.png",
            IndexEntry {
                remote_page_name: "Team:Amsterdam/q&a.png".to_string(),
                kind: ContentKind::Image,
                mime_type: "image/png",
            },
        );
        let rewriter = Rewriter::new(&index, BASE);
        let once = rewriter.rewrite("index.html", r#"<img src="q&a.png">"#, ContentKind::Html);
        assert_eq!(
            once.content,
            r#"<img src="https://2017.igem.org/Team:Amsterdam/q%26a.png?action=raw&ctype=image/png">"#
        );
        let twice = rewriter.rewrite("index.html", &once.content, ContentKind::Html);
        assert_eq!(once.content, twice.content);
        assert_eq!(twice.rewritten, 0);
    }

    #[test]
    fn javascript_is_left_as_is() {
        let index = index();
        let rewriter = Rewriter::new(&index, BASE);
        let js = "fetch('logo.png');";
        let result = rewriter.rewrite("js/app.js", js, ContentKind::Js);
        assert_eq!(result.content, js);
        assert_eq!(result.rewritten, 0);
    }
}
