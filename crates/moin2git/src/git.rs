use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{ChildStdin, Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

/// `git init` into a destination that must not exist yet.
pub fn init_repository(destination: &Path) -> Result<()> {
    if destination.exists() {
        bail!(
            "destination already exists: {} (refusing to import into it)",
            destination.display()
        );
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    run_git(destination, &["init", "--quiet"])
}

/// Runs `git fast-import` in `repository` and feeds it whatever `write_stream`
/// produces. The importer's exit status decides success.
pub fn fast_import<T>(
    repository: &Path,
    write_stream: impl FnOnce(BufWriter<ChildStdin>) -> Result<(T, BufWriter<ChildStdin>)>,
) -> Result<T> {
    let mut child = Command::new("git")
        .args(["fast-import", "--quiet"])
        .current_dir(repository)
        .stdin(Stdio::piped())
        .spawn()
        .context("failed to start git fast-import")?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("git fast-import stdin unavailable"))?;

    let outcome = write_stream(BufWriter::new(stdin)).and_then(|(value, mut writer)| {
        writer.flush().context("failed to flush import stream")?;
        Ok(value)
    });
    let value = match outcome {
        Ok(value) => value,
        Err(error) => {
            // A half-written stream must not be imported.
            let _ = child.kill();
            let _ = child.wait();
            return Err(error);
        }
    };
    let status = child
        .wait()
        .context("failed to wait for git fast-import")?;
    if !status.success() {
        bail!("git fast-import exited with {status}");
    }
    info!("git fast-import finished");
    Ok(value)
}

pub fn garbage_collect(repository: &Path) -> Result<()> {
    run_git(repository, &["gc", "--aggressive", "--quiet"])
}

pub fn checkout(repository: &Path, branch: &str) -> Result<()> {
    let name = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    run_git(repository, &["checkout", "--quiet", name])
}

fn run_git(repository: &Path, args: &[&str]) -> Result<()> {
    debug!("git {}", args.join(" "));
    let status = Command::new("git")
        .args(args)
        .current_dir(repository)
        .status()
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;
    if !status.success() {
        bail!("git {} exited with {status}", args.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use moin2git_core::edit_log::{EditEvent, EditKind};
    use moin2git_core::fast_import::{DEFAULT_BRANCH, FastImportStream};
    use moin2git_core::translate::Content;
    use moin2git_core::users::Identity;
    use tempfile::tempdir;

    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn save_event(name: &str) -> EditEvent {
        EditEvent {
            timestamp_micros: 1_600_000_000_000_000,
            revision_id: "00000001".to_string(),
            kind: EditKind::PageSave,
            page_name: name.to_string(),
            comment: String::new(),
            author_id: String::new(),
            source_page_dir: PathBuf::new(),
        }
    }

    fn branch_exists(repository: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", DEFAULT_BRANCH])
            .current_dir(repository)
            .output()
            .map(|output| output.status.success())
            .expect("run git rev-parse")
    }

    #[test]
    fn interrupted_stream_imports_nothing() {
        if !git_available() {
            return;
        }
        let temp = tempdir().expect("tempdir");
        let repository = temp.path().join("repo");
        init_repository(&repository).expect("init");

        let result = fast_import(&repository, |writer| {
            let mut stream = FastImportStream::new(writer, DEFAULT_BRANCH);
            stream.add_revision(
                &save_event("X"),
                &Identity::anonymous(),
                &Content::Bytes(b"one".to_vec()),
            )?;
            // Dropping the stream closes the importer's input mid-history.
            drop(stream);
            std::thread::sleep(std::time::Duration::from_millis(300));
            Err::<((), BufWriter<ChildStdin>), _>(anyhow!("renderer unavailable"))
        });
        assert!(result.is_err());
        assert!(!branch_exists(&repository));
    }

    #[test]
    fn completed_stream_creates_branch() {
        if !git_available() {
            return;
        }
        let temp = tempdir().expect("tempdir");
        let repository = temp.path().join("repo");
        init_repository(&repository).expect("init");

        fast_import(&repository, |writer| {
            let mut stream = FastImportStream::new(writer, DEFAULT_BRANCH);
            stream.add_revision(
                &save_event("X"),
                &Identity::anonymous(),
                &Content::Bytes(b"one".to_vec()),
            )?;
            Ok(((), stream.end_stream()?))
        })
        .expect("import");
        assert!(branch_exists(&repository));
    }

    #[test]
    fn init_refuses_existing_destination() {
        let temp = tempdir().expect("tempdir");
        let error = init_repository(temp.path()).expect_err("must refuse");
        assert!(error.to_string().contains("already exists"));
    }
}
