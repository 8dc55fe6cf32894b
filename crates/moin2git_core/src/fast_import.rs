use std::io::Write;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::edit_log::{EditEvent, EditKind};
use crate::filesystem::{attachment_export_path, export_path};
use crate::translate::Content;
use crate::users::Identity;

pub const DEFAULT_BRANCH: &str = "refs/heads/master";
const FILE_MODE: &str = "100644";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    BranchOpen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub commits: usize,
    pub blobs: usize,
    pub deletes: usize,
    pub renames: usize,
    pub attachments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileChange {
    Modify { blob_mark: u64, path: String },
    Delete { path: String },
}

/// Writer for the `git fast-import` command stream.
///
/// Marks are handed out in write order starting at 1, so every `from` and
/// `M` line can only name something already on the wire. Consuming the writer
/// with [`FastImportStream::end_stream`] is the only way to finish it: the
/// stream opens with `feature done`, so the importer rejects any input that
/// stops before the closing `done`.
#[derive(Debug)]
pub struct FastImportStream<W: Write> {
    output: W,
    branch: String,
    next_mark: u64,
    last_commit_mark: Option<u64>,
    header_written: bool,
    state: StreamState,
    stats: StreamStats,
}

impl<W: Write> FastImportStream<W> {
    pub fn new(output: W, branch: impl Into<String>) -> Self {
        Self {
            output,
            branch: branch.into(),
            next_mark: 1,
            last_commit_mark: None,
            header_written: false,
            state: StreamState::NotStarted,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn last_commit_mark(&self) -> Option<u64> {
        self.last_commit_mark
    }

    /// Write one event as a commit, preceded by its blob when it carries a
    /// payload. Returns the commit mark.
    pub fn add_revision(
        &mut self,
        event: &EditEvent,
        author: &Identity,
        content: &Content,
    ) -> Result<u64> {
        if !self.header_written {
            self.write_line("feature done")?;
            self.header_written = true;
        }
        let blob_mark = match (content, &event.kind) {
            (Content::Bytes(_), EditKind::Delete) | (Content::Tombstone, _) => None,
            (Content::Bytes(bytes), _) => Some(self.write_blob(bytes)?),
        };
        let page_path = event.export_path();
        let (changes, message) = plan_changes(event, &page_path, blob_mark);

        if self.state == StreamState::NotStarted {
            self.write_line(&format!("reset {}", self.branch))?;
            self.state = StreamState::BranchOpen;
        }
        self.write_line(&format!("commit {}", self.branch))?;
        let commit_mark = self.write_next_mark()?;
        self.write_changer("author", author, event)?;
        self.write_changer("committer", author, event)?;
        let message = if event.comment.is_empty() {
            message
        } else {
            event.comment.clone()
        };
        self.write_data(format!("{message}\n").as_bytes())?;
        if let Some(parent) = self.last_commit_mark {
            let parent = self.reference(parent)?;
            self.write_line(&format!("from :{parent}"))?;
        }
        for change in &changes {
            match change {
                FileChange::Modify { blob_mark, path } => {
                    let blob_mark = self.reference(*blob_mark)?;
                    self.write_line(&format!("M {FILE_MODE} :{blob_mark} {}", quote_path(path)))?;
                }
                FileChange::Delete { path } => {
                    self.stats.deletes += 1;
                    self.write_line(&format!("D {}", quote_path(path)))?;
                }
            }
        }
        self.write_line("")?;

        match &event.kind {
            EditKind::Rename { .. } => self.stats.renames += 1,
            EditKind::Attach { .. } => self.stats.attachments += 1,
            EditKind::PageSave | EditKind::Delete => {}
        }
        self.stats.commits += 1;
        self.last_commit_mark = Some(commit_mark);
        debug!("written commit {commit_mark} for {page_path}");
        Ok(commit_mark)
    }

    /// Point the branch at the final commit and hand back the output.
    pub fn end_stream(mut self) -> Result<W> {
        if let Some(last) = self.last_commit_mark {
            let last = self.reference(last)?;
            self.write_line(&format!("reset {}", self.branch))?;
            self.write_line(&format!("from :{last}"))?;
        }
        if self.header_written {
            self.write_line("done")?;
        }
        self.output
            .flush()
            .context("failed to flush import stream")?;
        Ok(self.output)
    }

    fn write_blob(&mut self, bytes: &[u8]) -> Result<u64> {
        self.write_line("blob")?;
        let mark = self.write_next_mark()?;
        self.write_data(bytes)?;
        self.write_line("")?;
        self.stats.blobs += 1;
        Ok(mark)
    }

    fn write_changer(&mut self, role: &str, identity: &Identity, event: &EditEvent) -> Result<()> {
        self.write_line(&format!(
            "{role} {} <{}> {} +0000",
            identity.moin_name,
            identity.email,
            event.epoch_seconds()
        ))
    }

    fn write_next_mark(&mut self) -> Result<u64> {
        let mark = self.next_mark;
        self.next_mark += 1;
        self.write_line(&format!("mark :{mark}"))?;
        Ok(mark)
    }

    fn reference(&self, mark: u64) -> Result<u64> {
        if mark == 0 || mark >= self.next_mark {
            bail!(
                "import stream references mark :{mark} before it was assigned (next is :{})",
                self.next_mark
            );
        }
        Ok(mark)
    }

    fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_line(&format!("data {}", bytes.len()))?;
        self.output
            .write_all(bytes)
            .context("failed to write import stream data")
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.output, "{line}").context("failed to write import stream")
    }
}

fn plan_changes(
    event: &EditEvent,
    page_path: &str,
    blob_mark: Option<u64>,
) -> (Vec<FileChange>, String) {
    match (&event.kind, blob_mark) {
        (EditKind::PageSave, Some(blob_mark)) => (
            vec![FileChange::Modify {
                blob_mark,
                path: page_path.to_string(),
            }],
            format!("Add/Update {page_path}"),
        ),
        (EditKind::Rename { previous_page_name }, Some(blob_mark)) => {
            let mut changes = Vec::with_capacity(2);
            if previous_page_name != &event.page_name {
                changes.push(FileChange::Delete {
                    path: export_path(previous_page_name),
                });
            }
            changes.push(FileChange::Modify {
                blob_mark,
                path: page_path.to_string(),
            });
            (changes, format!("Rename to {page_path}"))
        }
        (EditKind::Rename { previous_page_name }, None) => (
            vec![FileChange::Delete {
                path: export_path(previous_page_name),
            }],
            format!("Delete {}", export_path(previous_page_name)),
        ),
        (EditKind::Attach { attachment_name }, Some(blob_mark)) => (
            vec![FileChange::Modify {
                blob_mark,
                path: attachment_export_path(&event.page_name, attachment_name),
            }],
            format!("Attach {attachment_name} to {page_path}"),
        ),
        (EditKind::Attach { attachment_name }, None) => {
            let path = attachment_export_path(&event.page_name, attachment_name);
            let message = format!("Delete {path}");
            (vec![FileChange::Delete { path }], message)
        }
        (EditKind::PageSave | EditKind::Delete, _) => (
            vec![FileChange::Delete {
                path: page_path.to_string(),
            }],
            format!("Delete {page_path}"),
        ),
    }
}

/// C-style quoting for the few paths the line protocol cannot carry bare.
fn quote_path(path: &str) -> String {
    if !path.starts_with('"') && !path.contains(['\n', '\\']) {
        return path.to_string();
    }
    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for ch in path.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
