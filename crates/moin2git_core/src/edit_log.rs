use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::filesystem::{
    WikiLayout, attachment_path, edit_log_path, export_path, revision_path, unescape_page_name,
};

/// Minimum run of leading digits that marks a line as an edit record.
const TIMESTAMP_DIGITS: usize = 15;

const FIELD_TIMESTAMP: usize = 0;
const FIELD_REVISION: usize = 1;
const FIELD_ACTION: usize = 2;
const FIELD_PAGE_NAME: usize = 3;
const FIELD_AUTHOR_ID: usize = 6;
const FIELD_ATTACHMENT: usize = 7;
const FIELD_COMMENT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditKind {
    PageSave,
    Delete,
    Rename { previous_page_name: String },
    Attach { attachment_name: String },
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageSave => "save",
            Self::Delete => "delete",
            Self::Rename { .. } => "rename",
            Self::Attach { .. } => "attach",
        }
    }
}

/// One classified line of a page's edit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub timestamp_micros: i64,
    pub revision_id: String,
    pub kind: EditKind,
    /// Escaped page name, `/` written as `(2f)`.
    pub page_name: String,
    pub comment: String,
    pub author_id: String,
    pub source_page_dir: PathBuf,
}

impl EditEvent {
    pub fn unescaped_page_name(&self) -> String {
        unescape_page_name(&self.page_name)
    }

    pub fn export_path(&self) -> String {
        export_path(&self.page_name)
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.timestamp_micros.div_euclid(1_000_000)
    }

    pub fn revision_path(&self) -> PathBuf {
        revision_path(&self.source_page_dir, &self.revision_id)
    }

    pub fn attachment_path(&self) -> Option<PathBuf> {
        match &self.kind {
            EditKind::Attach { attachment_name } => {
                Some(attachment_path(&self.source_page_dir, attachment_name))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct RawRecord<'a> {
    timestamp_micros: i64,
    revision_id: &'a str,
    action: &'a str,
    page_name: &'a str,
    author_id: &'a str,
    attachment: &'a str,
    comment: &'a str,
}

fn parse_record(line: &str) -> Option<RawRecord<'_>> {
    let line = line.trim_end_matches(['\n', '\r']);
    let prefix = line.as_bytes().get(..TIMESTAMP_DIGITS)?;
    if !prefix.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let fields = line.split('\t').collect::<Vec<_>>();
    let field = |index: usize| fields.get(index).copied().unwrap_or("");
    let timestamp_micros = field(FIELD_TIMESTAMP).parse::<i64>().ok()?;
    let revision_id = field(FIELD_REVISION);
    let page_name = field(FIELD_PAGE_NAME);
    if revision_id.is_empty() || page_name.is_empty() {
        return None;
    }
    Some(RawRecord {
        timestamp_micros,
        revision_id,
        action: field(FIELD_ACTION),
        page_name,
        author_id: field(FIELD_AUTHOR_ID),
        attachment: field(FIELD_ATTACHMENT),
        comment: field(FIELD_COMMENT),
    })
}

/// Accumulator for one page log: the page name seen on the previous record
/// feeds the next rename.
#[derive(Debug, Default)]
struct LogScan {
    previous_name: Option<String>,
    events: Vec<EditEvent>,
}

impl LogScan {
    fn step(mut self, line: &str, page_dir: &Path) -> Self {
        let Some(record) = parse_record(line) else {
            return self;
        };
        // The log already stores the quoted directory form.
        let page_name = record.page_name.to_string();
        let previous_name = self.previous_name.replace(page_name.clone());

        let kind = match record.action {
            "SAVE" | "SAVENEW" | "SAVE/REVERT" => {
                if revision_path(page_dir, record.revision_id).is_file() {
                    Some(EditKind::PageSave)
                } else {
                    Some(EditKind::Delete)
                }
            }
            "SAVE/RENAME" => Some(EditKind::Rename {
                previous_page_name: previous_name.unwrap_or_else(|| page_name.clone()),
            }),
            "ATTNEW" => {
                if !record.attachment.is_empty()
                    && attachment_path(page_dir, record.attachment).is_file()
                {
                    Some(EditKind::Attach {
                        attachment_name: record.attachment.to_string(),
                    })
                } else {
                    debug!(
                        "dropping attachment {} on {}: file missing",
                        record.attachment, page_name
                    );
                    None
                }
            }
            other => {
                debug!("dropping {other} record on {page_name}");
                None
            }
        };

        if let Some(kind) = kind {
            self.events.push(EditEvent {
                timestamp_micros: record.timestamp_micros,
                revision_id: record.revision_id.to_string(),
                kind,
                page_name,
                comment: record.comment.to_string(),
                author_id: record.author_id.to_string(),
                source_page_dir: page_dir.to_path_buf(),
            });
        }
        self
    }
}

/// Classify the records of one page's log text in file order.
pub fn parse_edit_log(content: &str, page_dir: &Path) -> Vec<EditEvent> {
    content
        .lines()
        .fold(LogScan::default(), |scan, line| scan.step(line, page_dir))
        .events
}

/// Read and classify one page directory. A missing or unreadable log yields
/// no events.
pub fn read_page_events(page_dir: &Path) -> Vec<EditEvent> {
    let log_path = edit_log_path(page_dir);
    match fs::read(&log_path) {
        Ok(bytes) => parse_edit_log(&String::from_utf8_lossy(&bytes), page_dir),
        Err(error) => {
            warn!("no edit-log for page {}: {error}", page_dir.display());
            Vec::new()
        }
    }
}

/// Events of every page, grouped by page directory in directory order.
pub fn read_all_events(layout: &WikiLayout) -> anyhow::Result<Vec<EditEvent>> {
    let mut events = Vec::new();
    for page_dir in layout.page_dirs()? {
        debug!("reading page {}", page_dir.display());
        events.extend(read_page_events(&page_dir));
    }
    Ok(events)
}
