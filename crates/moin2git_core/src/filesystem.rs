use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Escaped form of `/` inside legacy page names.
pub const PATH_SEPARATOR_TOKEN: &str = "(2f)";
pub const EXPORT_EXTENSION: &str = "md";
pub const ATTACHMENTS_DIR: &str = "attachments";

const EDIT_LOG_FILENAME: &str = "edit-log";
const REVISIONS_DIR: &str = "revisions";
const PAGES_DIR: &str = "pages";
const USERS_DIR: &str = "user";

/// On-disk layout of a MoinMoin data directory.
#[derive(Debug, Clone)]
pub struct WikiLayout {
    pub data_dir: PathBuf,
}

impl WikiLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join(PAGES_DIR)
    }

    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join(USERS_DIR)
    }

    /// Page directories in file-name order.
    pub fn page_dirs(&self) -> Result<Vec<PathBuf>> {
        let pages_dir = self.pages_dir();
        let mut out = Vec::new();
        for entry in WalkDir::new(&pages_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry =
                entry.with_context(|| format!("failed to list {}", pages_dir.display()))?;
            if entry.file_type().is_dir() {
                out.push(entry.into_path());
            }
        }
        Ok(out)
    }
}

pub fn edit_log_path(page_dir: &Path) -> PathBuf {
    page_dir.join(EDIT_LOG_FILENAME)
}

pub fn revision_path(page_dir: &Path, revision_id: &str) -> PathBuf {
    page_dir.join(REVISIONS_DIR).join(revision_id)
}

pub fn attachment_path(page_dir: &Path, attachment_name: &str) -> PathBuf {
    page_dir.join(ATTACHMENTS_DIR).join(attachment_name)
}

/// Quote a page name the way the wiki names its page directories: every byte
/// outside `[A-Za-z0-9_.-]` becomes a parenthesised run of lowercase hex.
/// `/` always gets a group of its own so the separator token stays intact.
pub fn escape_page_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = String::new();
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            flush_quoted(&mut out, &mut pending);
            out.push(char::from(byte));
        } else if byte == b'/' {
            flush_quoted(&mut out, &mut pending);
            out.push_str(PATH_SEPARATOR_TOKEN);
        } else {
            pending.push_str(&format!("{byte:02x}"));
        }
    }
    flush_quoted(&mut out, &mut pending);
    out
}

fn flush_quoted(out: &mut String, pending: &mut String) {
    if !pending.is_empty() {
        out.push('(');
        out.push_str(pending);
        out.push(')');
        pending.clear();
    }
}

/// Reverse of [`escape_page_name`]. Malformed groups are kept verbatim.
pub fn unescape_page_name(escaped: &str) -> String {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(open) = rest.find('(') {
        bytes.extend_from_slice(&rest.as_bytes()[..open]);
        let after = &rest[open + 1..];
        match after.find(')').and_then(|close| {
            decode_hex_run(&after[..close]).map(|decoded| (close, decoded))
        }) {
            Some((close, decoded)) => {
                bytes.extend_from_slice(&decoded);
                rest = &after[close + 1..];
            }
            None => {
                bytes.push(b'(');
                rest = after;
            }
        }
    }
    bytes.extend_from_slice(rest.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

fn decode_hex_run(run: &str) -> Option<Vec<u8>> {
    if run.is_empty() || run.len() % 2 != 0 {
        return None;
    }
    (0..run.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(run.get(index..index + 2)?, 16).ok())
        .collect()
}

/// Repository path of a page. Every add, delete and rename goes through here.
pub fn export_path(escaped_page_name: &str) -> String {
    format!("{}.{EXPORT_EXTENSION}", export_stem(escaped_page_name))
}

pub fn export_stem(escaped_page_name: &str) -> String {
    escaped_page_name.replace(PATH_SEPARATOR_TOKEN, "_")
}

pub fn attachment_export_path(escaped_page_name: &str, attachment_name: &str) -> String {
    format!(
        "{ATTACHMENTS_DIR}/{}/{attachment_name}",
        export_stem(escaped_page_name)
    )
}
