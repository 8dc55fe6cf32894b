use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::Url;
use tracing::{debug, warn};

use crate::edit_log::{EditEvent, EditKind};
use crate::fetch_cache::Fetch;
use crate::history::HistoryIndex;

pub const DEFAULT_URL_PREFIX: &str = "http://localhost/jrtwiki/";
const CONTENT_ELEMENT_MARKER: &str = "id=\"content\"";

/// Payload of one event: bytes to commit, or nothing because the page is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Vec<u8>),
    Tombstone,
}

impl Content {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

pub trait Translate {
    fn translate(&mut self, event: &EditEvent) -> Result<Content>;
}

/// Commits the stored wiki markup as-is. Needs no server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTranslator;

impl Translate for RawTranslator {
    fn translate(&mut self, event: &EditEvent) -> Result<Content> {
        match &event.kind {
            EditKind::Delete => Ok(Content::Tombstone),
            EditKind::Attach { .. } => read_attachment(event),
            EditKind::PageSave | EditKind::Rename { .. } => {
                let path = event.revision_path();
                if !path.is_file() {
                    return Ok(Content::Tombstone);
                }
                let bytes =
                    fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
                Ok(Content::Bytes(bytes))
            }
        }
    }
}

/// Turns rendered HTML into the committed document format.
pub trait Convert {
    fn convert(&self, html: &str) -> Result<Vec<u8>>;
}

/// Runs `pandoc -f html -t gfm`.
#[derive(Debug, Clone)]
pub struct PandocConverter {
    pub program: String,
}

impl Default for PandocConverter {
    fn default() -> Self {
        Self {
            program: "pandoc".to_string(),
        }
    }
}

impl Convert for PandocConverter {
    fn convert(&self, html: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(["-f", "html", "-t", "gfm"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} stdin unavailable", self.program))?;
        let input = html.as_bytes().to_vec();
        let writer = thread::spawn(move || stdin.write_all(&input));
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for {}", self.program))?;
        writer
            .join()
            .map_err(|_| anyhow!("{} stdin writer panicked", self.program))?
            .with_context(|| format!("failed to write to {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

/// Fetches each revision as rendered by the live wiki, keeps the content
/// element, points in-wiki links at exported paths and converts the result.
pub struct RenderedTranslator<'a, F: Fetch, C: Convert> {
    fetcher: F,
    converter: C,
    index: &'a HistoryIndex,
    base: Url,
}

impl<'a, F: Fetch, C: Convert> RenderedTranslator<'a, F, C> {
    pub fn new(
        url_prefix: &str,
        fetcher: F,
        converter: C,
        index: &'a HistoryIndex,
    ) -> Result<Self> {
        let mut prefix = url_prefix.trim().to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let base = Url::parse(&prefix).with_context(|| format!("invalid url prefix {prefix}"))?;
        Ok(Self {
            fetcher,
            converter,
            index,
            base,
        })
    }

    pub fn revision_url(&self, event: &EditEvent) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url prefix cannot carry a path: {}", self.base))?
            .pop_if_empty()
            .extend(event.unescaped_page_name().split('/'));
        let revision = event
            .revision_id
            .parse::<u64>()
            .map(|number| number.to_string())
            .unwrap_or_else(|_| event.revision_id.clone());
        url.query_pairs_mut()
            .append_pair("action", "recall")
            .append_pair("rev", &revision);
        Ok(url)
    }
}

impl<F: Fetch, C: Convert> Translate for RenderedTranslator<'_, F, C> {
    fn translate(&mut self, event: &EditEvent) -> Result<Content> {
        match &event.kind {
            EditKind::Delete => Ok(Content::Tombstone),
            EditKind::Attach { .. } => read_attachment(event),
            EditKind::PageSave | EditKind::Rename { .. } => {
                if !event.revision_path().is_file() {
                    return Ok(Content::Tombstone);
                }
                let url = self.revision_url(event)?;
                let html = self.fetcher.fetch(url.as_str())?;
                let section = match extract_content_section(&html) {
                    Some(section) => section,
                    None => {
                        warn!("no content element in {url}; converting whole page");
                        html.as_str()
                    }
                };
                let linked = rewrite_links(section, &self.base, self.index);
                let converted = self.converter.convert(&linked)?;
                debug!("translated {} rev {}", event.page_name, event.revision_id);
                Ok(Content::Bytes(converted))
            }
        }
    }
}

fn read_attachment(event: &EditEvent) -> Result<Content> {
    let path = event
        .attachment_path()
        .ok_or_else(|| anyhow!("{} is not an attachment event", event.page_name))?;
    let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Content::Bytes(bytes))
}

/// Inner HTML of the element carrying `id="content"`.
pub fn extract_content_section(html: &str) -> Option<&str> {
    let marker = html.find(CONTENT_ELEMENT_MARKER)?;
    let open = html[..marker].rfind('<')?;
    let tag_name = html[open + 1..marker]
        .split(|ch: char| ch.is_whitespace())
        .next()
        .filter(|name| !name.is_empty())?;
    let body_start = open + html[open..].find('>')? + 1;
    let opener = format!("<{tag_name}");
    let closer = format!("</{tag_name}>");

    let mut depth = 1usize;
    let mut cursor = body_start;
    loop {
        let next_close = cursor + html[cursor..].find(&closer)?;
        match html[cursor..next_close].find(&opener) {
            Some(offset) => {
                depth += 1;
                cursor += offset + opener.len();
            }
            None => {
                depth -= 1;
                if depth == 0 {
                    return Some(&html[body_start..next_close]);
                }
                cursor = next_close + closer.len();
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LinkTarget {
    Foreign,
    Resolved(String),
    Unresolved,
}

fn classify_href(href: &str, base: &Url, index: &HistoryIndex) -> LinkTarget {
    let href = href.replace("&amp;", "&");
    if href.starts_with('#') {
        return LinkTarget::Foreign;
    }
    let Ok(target) = base.join(&href) else {
        return LinkTarget::Foreign;
    };
    if target.origin() != base.origin() {
        return LinkTarget::Foreign;
    }
    let Some(page_path) = target.path().strip_prefix(base.path()) else {
        return LinkTarget::Foreign;
    };
    let page_name = percent_decode(page_path);

    let mut action = None;
    let mut attachment = None;
    for (key, value) in target.query_pairs() {
        match key.as_ref() {
            "action" => action = Some(value.into_owned()),
            "target" => attachment = Some(value.into_owned()),
            _ => {}
        }
    }
    let resolved = match (action.as_deref(), attachment) {
        (Some("AttachFile"), Some(attachment)) => {
            index.resolve_attachment(&page_name, &attachment)
        }
        _ => index.resolve(&page_name),
    };
    match resolved {
        Some(path) => LinkTarget::Resolved(path),
        None => LinkTarget::Unresolved,
    }
}

/// Point in-wiki anchors at exported paths. Anchors whose target never existed
/// lose their wrapper but keep their text.
pub fn rewrite_links(html: &str, base: &Url, index: &HistoryIndex) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = find_anchor_open(rest) {
        out.push_str(&rest[..start]);
        let Some(tag_len) = rest[start..].find('>').map(|offset| offset + 1) else {
            break;
        };
        let tag = &rest[start..start + tag_len];
        rest = &rest[start + tag_len..];
        let target = match extract_href(tag) {
            Some(href) => classify_href(href, base, index),
            None => LinkTarget::Foreign,
        };
        match target {
            LinkTarget::Foreign => out.push_str(tag),
            LinkTarget::Resolved(path) => out.push_str(&format!("<a href=\"{path}\">")),
            LinkTarget::Unresolved => {
                if let Some(close) = rest.find("</a>") {
                    out.push_str(&rest[..close]);
                    rest = &rest[close + "</a>".len()..];
                }
            }
        }
    }
    out.push_str(rest);
    out
}

fn find_anchor_open(html: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = html[offset..].find("<a") {
        let at = offset + found;
        match html.as_bytes().get(at + 2) {
            Some(byte) if byte.is_ascii_whitespace() || *byte == b'>' => return Some(at),
            _ => offset = at + 2,
        }
    }
    None
}

fn extract_href(tag: &str) -> Option<&str> {
    let start = tag.find("href=")? + "href=".len();
    let quote = tag[start..].chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value_start = start + 1;
    let value_len = tag[value_start..].find(quote)?;
    Some(&tag[value_start..value_start + value_len])
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let Some(decoded) = value
                .get(index + 1..index + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(decoded);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
