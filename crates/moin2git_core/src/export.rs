use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::fast_import::{DEFAULT_BRANCH, FastImportStream, StreamStats};
use crate::history::{HOME_PAGE_NAME, HistoryIndex};
use crate::translate::{Content, Translate};
use crate::users::UserSet;

const PROGRESS_EVERY: usize = 250;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub branch: String,
    pub home_page: bool,
    /// Date of the synthesized home page commit; `None` means now.
    pub generated_at_micros: Option<i64>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH.to_string(),
            home_page: true,
            generated_at_micros: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub events: usize,
    pub home_page: bool,
    pub stream: StreamStats,
}

/// Write the whole history as one import stream. Any error leaves the stream
/// unterminated, which the importer rejects.
pub fn export_history<W: Write, T: Translate + ?Sized>(
    index: &HistoryIndex,
    users: &UserSet,
    translator: &mut T,
    options: &ExportOptions,
    output: W,
) -> Result<(ExportReport, W)> {
    let mut stream = FastImportStream::new(output, options.branch.clone());
    let total = index.len();
    for (position, event) in index.events().iter().enumerate() {
        let content = translator.translate(event).with_context(|| {
            format!(
                "failed to translate {} revision {}",
                event.unescaped_page_name(),
                event.revision_id
            )
        })?;
        let author = users.resolve_author(&event.author_id);
        stream.add_revision(event, author, &content)?;
        if (position + 1) % PROGRESS_EVERY == 0 {
            info!("exported {} of {total} revisions", position + 1);
        }
    }

    if options.home_page {
        let generated_at = match options.generated_at_micros {
            Some(micros) => micros,
            None => now_micros()?,
        };
        if index.latest_for_page(HOME_PAGE_NAME).is_some() {
            warn!(
                "wiki has its own {HOME_PAGE_NAME} page; the generated index replaces its file"
            );
        }
        let home = index.home_page(generated_at);
        stream.add_revision(
            &home.event,
            &home.author,
            &Content::Bytes(home.content.into_bytes()),
        )?;
    }

    let stats = stream.stats().clone();
    let output = stream.end_stream()?;
    info!("exported {total} revisions in {} commits", stats.commits);
    Ok((
        ExportReport {
            events: total,
            home_page: options.home_page,
            stream: stats,
        },
        output,
    ))
}

pub fn now_micros() -> Result<i64> {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_micros();
    i64::try_from(micros).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::edit_log::read_all_events;
    use crate::filesystem::WikiLayout;
    use crate::translate::RawTranslator;
    use crate::users::Identity;

    const BASE: i64 = 1_600_000_000_000_000;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    fn log_line(ts: i64, rev: &str, action: &str, name: &str, attachment: &str) -> String {
        format!("{ts}\t{rev}\t{action}\t{name}\t10.0.0.1\thost\t1.2.3\t{attachment}\t\n")
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        layout: WikiLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let layout = WikiLayout::new(temp.path().join("data"));
            fs::create_dir_all(layout.pages_dir()).expect("create pages");
            Self {
                _temp: temp,
                layout,
            }
        }

        fn page(&self, dir: &str, log: &[String], revisions: &[(&str, &str)]) {
            let page_dir = self.layout.pages_dir().join(dir);
            write_file(&page_dir.join("edit-log"), &log.concat());
            for (rev, body) in revisions {
                write_file(&page_dir.join("revisions").join(rev), body);
            }
        }

        fn export(&self, home_page: bool) -> (ExportReport, String) {
            let events = read_all_events(&self.layout).expect("read events");
            let index = HistoryIndex::build(events);
            let users = UserSet::from_identities(vec![Identity {
                email: "ada@example.com".to_string(),
                moin_id: "1.2.3".to_string(),
                moin_name: "Ada".to_string(),
            }]);
            let options = ExportOptions {
                home_page,
                generated_at_micros: Some(BASE + 99_000_000),
                ..ExportOptions::default()
            };
            let (report, output) =
                export_history(&index, &users, &mut RawTranslator, &options, Vec::new())
                    .expect("export");
            (report, String::from_utf8(output).expect("utf8"))
        }
    }

    /// Walks the stream, skipping data payloads, and checks every mark is
    /// declared before it is referenced. Returns the commit bodies.
    fn check_marks(stream: &str) -> Vec<String> {
        let mut declared = HashSet::new();
        let mut commits = Vec::new();
        let mut rest = stream;
        while let Some(newline) = rest.find('\n') {
            let line = &rest[..newline];
            rest = &rest[newline + 1..];
            if let Some(length) = line.strip_prefix("data ") {
                let length = length.parse::<usize>().expect("data length");
                rest = &rest[length..];
                continue;
            }
            if line.starts_with("commit ") {
                commits.push(String::new());
            }
            if let Some(last) = commits.last_mut() {
                last.push_str(line);
                last.push('\n');
            }
            if let Some(mark) = line.strip_prefix("mark :") {
                assert!(declared.insert(mark.to_string()), "mark {mark} declared twice");
            }
            let referenced = line
                .strip_prefix("from :")
                .or_else(|| line.strip_prefix("M 100644 :").and_then(|r| r.split(' ').next()));
            if let Some(mark) = referenced {
                assert!(declared.contains(mark), "mark {mark} used before declared");
            }
        }
        commits
    }

    #[test]
    fn save_delete_save_yields_three_commits() {
        let fixture = Fixture::new();
        fixture.page(
            "X",
            &[
                log_line(BASE, "00000001", "SAVENEW", "X", ""),
                log_line(BASE + 10, "00000002", "SAVE", "X", ""),
                log_line(BASE + 20, "00000003", "SAVE", "X", ""),
            ],
            &[("00000001", "first"), ("00000003", "third")],
        );

        let (report, stream) = fixture.export(false);
        assert_eq!(report.events, 3);
        assert_eq!(report.stream.commits, 3);
        assert_eq!(report.stream.blobs, 2);

        let commits = check_marks(&stream);
        assert_eq!(commits.len(), 3);
        assert!(commits[0].contains("M 100644 :1 X.md\n"));
        assert!(commits[1].contains("D X.md\n"));
        assert!(!commits[1].contains("\nM "));
        assert!(commits[2].contains("M 100644 :4 X.md\n"));
        assert!(stream.ends_with("reset refs/heads/master\nfrom :5\ndone\n"));
    }

    #[test]
    fn pages_interleave_by_timestamp() {
        let fixture = Fixture::new();
        fixture.page(
            "A",
            &[
                log_line(BASE, "00000001", "SAVENEW", "A", ""),
                log_line(BASE + 30, "00000002", "SAVE", "A", ""),
            ],
            &[("00000001", "a1"), ("00000002", "a2")],
        );
        fixture.page(
            "A(2f)B",
            &[log_line(BASE + 20, "00000001", "SAVENEW", "A(2f)B", "")],
            &[("00000001", "b1")],
        );

        let (_, stream) = fixture.export(false);
        let commits = check_marks(&stream);
        let paths = commits
            .iter()
            .map(|commit| {
                commit
                    .lines()
                    .find_map(|line| line.strip_prefix("M 100644 :"))
                    .and_then(|rest| rest.split(' ').nth(1))
                    .expect("modify line")
                    .to_string()
            })
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["A.md", "A_B.md", "A.md"]);
    }

    #[test]
    fn rename_then_save_has_no_redundant_delete() {
        let fixture = Fixture::new();
        fixture.page(
            "New",
            &[
                log_line(BASE, "00000001", "SAVENEW", "Old", ""),
                log_line(BASE + 10, "00000002", "SAVE/RENAME", "New", ""),
                log_line(BASE + 20, "00000003", "SAVE", "New", ""),
            ],
            &[("00000001", "v1"), ("00000002", "v2"), ("00000003", "v3")],
        );

        let (report, stream) = fixture.export(false);
        assert_eq!(report.stream.renames, 1);
        let commits = check_marks(&stream);
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[1].matches("D Old.md\n").count(), 1);
        assert_eq!(commits[1].matches("New.md\n").count(), 1);
        assert!(!commits[2].contains("\nD "));
        assert!(commits[2].contains("New.md\n"));
    }

    #[test]
    fn attachments_and_home_page_are_committed() {
        let fixture = Fixture::new();
        fixture.page(
            "A",
            &[
                log_line(BASE, "00000001", "SAVENEW", "A", ""),
                log_line(BASE + 5, "99999999", "ATTNEW", "A", "pic.png"),
            ],
            &[("00000001", "a")],
        );
        write_file(
            &fixture.layout.pages_dir().join("A").join("attachments").join("pic.png"),
            "png",
        );
        fixture.page(
            "A(2f)B",
            &[log_line(BASE + 10, "00000001", "SAVENEW", "A(2f)B", "")],
            &[("00000001", "b")],
        );

        let (report, stream) = fixture.export(true);
        assert_eq!(report.stream.attachments, 1);
        assert!(report.home_page);
        let commits = check_marks(&stream);
        assert_eq!(commits.len(), 4);
        assert!(commits[1].contains("M 100644 :3 attachments/A/pic.png\n"));

        let home = commits.last().expect("home commit");
        assert!(home.contains("author moin2git <moin2git@example.org> 1600000099 +0000\n"));
        assert!(home.contains("Home.md\n"));
        assert!(stream.contains("# Home\n\n* [A](A.md)\n  * [B](A_B.md)\n"));
    }

    #[test]
    fn unknown_authors_are_anonymous() {
        let fixture = Fixture::new();
        fixture.page(
            "P",
            &[format!("{BASE}\t00000001\tSAVENEW\tP\t10.0.0.1\thost\t\t\t\n")],
            &[("00000001", "p")],
        );
        let (_, stream) = fixture.export(false);
        assert!(stream.contains("author anonymous <anonymous@example.org> 1600000000 +0000\n"));
    }

    struct FailOnSecond {
        calls: usize,
    }

    impl Translate for FailOnSecond {
        fn translate(&mut self, event: &crate::edit_log::EditEvent) -> Result<Content> {
            self.calls += 1;
            if self.calls == 2 {
                anyhow::bail!("renderer unavailable");
            }
            RawTranslator.translate(event)
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "importer gone"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn translation_failure_leaves_stream_unterminated() {
        let fixture = Fixture::new();
        fixture.page(
            "X",
            &[
                log_line(BASE, "00000001", "SAVENEW", "X", ""),
                log_line(BASE + 10, "00000002", "SAVE", "X", ""),
            ],
            &[("00000001", "one"), ("00000002", "two")],
        );
        let index = HistoryIndex::build(read_all_events(&fixture.layout).expect("read events"));
        let users = UserSet::from_identities(Vec::new());
        let mut buffer = Vec::new();
        let mut translator = FailOnSecond { calls: 0 };

        let error = export_history(
            &index,
            &users,
            &mut translator,
            &ExportOptions::default(),
            &mut buffer,
        )
        .expect_err("must fail");
        assert!(format!("{error:#}").contains("renderer unavailable"));
        assert!(format!("{error:#}").contains("revision 00000002"));

        let stream = String::from_utf8(buffer).expect("utf8");
        assert!(stream.contains("M 100644 :1 X.md\n"));
        assert!(!stream.contains("reset refs/heads/master\nfrom :"));
        assert!(!stream.contains("\ndone\n"));
    }

    #[test]
    fn write_failure_propagates() {
        let mut stream = FastImportStream::new(BrokenPipe, DEFAULT_BRANCH);
        let event = crate::edit_log::EditEvent {
            timestamp_micros: BASE,
            revision_id: "00000001".to_string(),
            kind: crate::edit_log::EditKind::PageSave,
            page_name: "X".to_string(),
            comment: String::new(),
            author_id: String::new(),
            source_page_dir: Default::default(),
        };
        let error = stream
            .add_revision(&event, &Identity::anonymous(), &Content::Bytes(b"x".to_vec()))
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to write import stream"));

        let fixture = Fixture::new();
        fixture.page(
            "X",
            &[log_line(BASE, "00000001", "SAVENEW", "X", "")],
            &[("00000001", "one")],
        );
        let index = HistoryIndex::build(read_all_events(&fixture.layout).expect("read events"));
        let users = UserSet::from_identities(Vec::new());
        assert!(
            export_history(
                &index,
                &users,
                &mut RawTranslator,
                &ExportOptions::default(),
                BrokenPipe,
            )
            .is_err()
        );
    }

    #[test]
    fn real_home_page_is_left_out_of_the_index() {
        let fixture = Fixture::new();
        fixture.page(
            "Home",
            &[log_line(BASE, "00000001", "SAVENEW", "Home", "")],
            &[("00000001", "old home")],
        );
        fixture.page(
            "Notes",
            &[log_line(BASE + 1, "00000001", "SAVENEW", "Notes", "")],
            &[("00000001", "notes")],
        );
        let (report, stream) = fixture.export(true);
        assert_eq!(report.stream.commits, 3);
        assert!(stream.contains("# Home\n\n* [Notes](Notes.md)\n"));
        assert!(!stream.contains("[Home](Home.md)"));
    }

    #[test]
    fn output_is_reproducible() {
        let fixture = Fixture::new();
        fixture.page(
            "A",
            &[log_line(BASE, "00000001", "SAVENEW", "A", "")],
            &[("00000001", "a")],
        );
        fixture.page(
            "B",
            &[log_line(BASE, "00000001", "SAVENEW", "B", "")],
            &[("00000001", "b")],
        );
        let (_, first) = fixture.export(true);
        let (_, second) = fixture.export(true);
        assert_eq!(first, second);
    }
}
