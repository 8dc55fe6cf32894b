mod git;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use clap::builder::BoolishValueParser;
use clap::{Args, CommandFactory, Parser, Subcommand};
use moin2git_core::edit_log::read_all_events;
use moin2git_core::export::{ExportOptions, ExportReport, export_history};
use moin2git_core::fetch_cache::FetchCache;
use moin2git_core::filesystem::escape_page_name;
use moin2git_core::history::HistoryIndex;
use moin2git_core::runtime::{
    ResolvedSettings, SettingOverrides, normalize_for_display, resolve_settings,
};
use moin2git_core::translate::{
    Content, PandocConverter, RawTranslator, RenderedTranslator, Translate,
};
use moin2git_core::users::UserSet;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

const DEFAULT_LOG_FILE: &str = "moin2git.log";

#[derive(Debug, Parser)]
#[command(
    name = "moin2git",
    version,
    about = "Replay a MoinMoin wiki's edit history into a git repository"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "MoinMoin data directory")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "FILE", help = "JSON user map (see save-users)")]
    user_map: Option<PathBuf>,
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        env = "MOIN2GIT_DEBUG",
        value_parser = BoolishValueParser::new(),
        help = "Log at debug level"
    )]
    debug: bool,
    #[arg(
        short,
        long,
        global = true,
        env = "MOIN2GIT_VERBOSE",
        value_parser = BoolishValueParser::new(),
        help = "Log progress"
    )]
    verbose: bool,
    #[arg(
        long,
        global = true,
        value_name = "URL",
        env = "MOIN2GIT_PROXY",
        value_delimiter = ',',
        help = "Proxy for wiki requests (repeatable)"
    )]
    proxy: Vec<String>,
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "MOIN2GIT_LOG_FILE",
        default_value = DEFAULT_LOG_FILE,
        help = "Debug log written on every run"
    )]
    log_file: PathBuf,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Check that the wiki data directory is usable")]
    Check,
    #[command(name = "save-users", about = "Write the wiki's user map as JSON")]
    SaveUsers(SaveUsersArgs),
    #[command(name = "fast-export", about = "Create a git repository from the wiki history")]
    FastExport(FastExportArgs),
    #[command(about = "Write the import stream without running git")]
    Stream(StreamArgs),
    #[command(name = "translate-page", about = "Print one translated page revision")]
    TranslatePage(TranslatePageArgs),
    #[command(about = "List the ordered edit history")]
    History,
}

#[derive(Debug, Args)]
struct SaveUsersArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ExportFlags {
    #[arg(long, value_name = "PATH", help = "Directory holding the fetch cache")]
    cache_dir: Option<PathBuf>,
    #[arg(long, value_name = "URL", help = "Base URL of the running wiki")]
    url_prefix: Option<String>,
    #[arg(long, value_name = "REF", help = "Branch to import into")]
    branch: Option<String>,
    #[arg(long, help = "Skip the generated Home page commit")]
    no_home_page: bool,
    #[arg(long, help = "Commit raw wiki markup instead of fetched, converted pages")]
    raw: bool,
}

#[derive(Debug, Args)]
struct FastExportArgs {
    #[command(flatten)]
    flags: ExportFlags,
    destination: PathBuf,
}

#[derive(Debug, Args)]
struct StreamArgs {
    #[command(flatten)]
    flags: ExportFlags,
    #[arg(short, long, value_name = "FILE", help = "Write to FILE instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TranslatePageArgs {
    #[command(flatten)]
    flags: ExportFlags,
    page: String,
    version: String,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    data_dir: Option<PathBuf>,
    user_map: Option<PathBuf>,
    config: Option<PathBuf>,
    proxies: Vec<String>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            data_dir: cli.data_dir.clone(),
            user_map: cli.user_map.clone(),
            config: cli.config.clone(),
            proxies: cli.proxy.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(log_level(cli.debug, cli.verbose), &cli.log_file)?;
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Check) => run_check(&runtime),
        Some(Commands::SaveUsers(args)) => run_save_users(&runtime, &args.file),
        Some(Commands::FastExport(args)) => run_fast_export(&runtime, args),
        Some(Commands::Stream(args)) => run_stream(&runtime, args),
        Some(Commands::TranslatePage(args)) => run_translate_page(&runtime, args),
        Some(Commands::History) => run_history(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn log_level(debug: bool, verbose: bool) -> Level {
    if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        Level::WARN
    }
}

/// Console output at the chosen level on stderr, plus a full debug log file.
fn init_logging(level: Level, log_file: &Path) -> Result<()> {
    let console = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(LevelFilter::from_level(level));
    let file = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        ),
        Err(error) => {
            eprintln!(
                "warning: cannot open log file {}: {error}",
                normalize_for_display(log_file)
            );
            None
        }
    };
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}

fn run_check(runtime: &RuntimeOptions) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, None)?;
    let layout = settings.layout();
    let pages_dir = layout.pages_dir();
    if !pages_dir.is_dir() {
        bail!(
            "no pages directory under {}",
            normalize_for_display(&settings.data_dir.value)
        );
    }
    println!("System check identified no issues");
    print_diagnostics(runtime, &settings);
    Ok(())
}

fn run_save_users(runtime: &RuntimeOptions, file: &Path) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, None)?;
    let users = UserSet::load_from_wiki_data(&settings.layout())?;
    users.save_to_file(file)?;
    println!(
        "saved {} users to {}",
        users.len(),
        normalize_for_display(file)
    );
    print_diagnostics(runtime, &settings);
    Ok(())
}

fn run_fast_export(runtime: &RuntimeOptions, args: FastExportArgs) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, Some(&args.flags))?;
    let index = load_history(&settings)?;
    let users = load_users(&settings)?;
    let options = export_options(&settings, &args.flags);
    let mut translator = build_translator(runtime, &settings, &args.flags, &index)?;

    git::init_repository(&args.destination)?;
    let report = git::fast_import(&args.destination, |writer| {
        export_history(&index, &users, translator.as_mut(), &options, writer)
    })?;
    git::garbage_collect(&args.destination)?;
    if report.stream.commits > 0 {
        git::checkout(&args.destination, &options.branch)?;
    }

    println!("fast-export");
    println!(
        "destination: {}",
        normalize_for_display(&args.destination)
    );
    print_report(&report);
    print_diagnostics(runtime, &settings);
    Ok(())
}

fn run_stream(runtime: &RuntimeOptions, args: StreamArgs) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, Some(&args.flags))?;
    let index = load_history(&settings)?;
    let users = load_users(&settings)?;
    let options = export_options(&settings, &args.flags);
    let mut translator = build_translator(runtime, &settings, &args.flags, &index)?;

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let (report, mut writer) = export_history(
                &index,
                &users,
                translator.as_mut(),
                &options,
                BufWriter::new(file),
            )?;
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", path.display()))?;
            println!("stream");
            println!("output: {}", normalize_for_display(path));
            print_report(&report);
            print_diagnostics(runtime, &settings);
        }
        None => {
            let stdout = io::stdout().lock();
            let (_, mut writer) = export_history(
                &index,
                &users,
                translator.as_mut(),
                &options,
                BufWriter::new(stdout),
            )?;
            writer.flush().context("failed to flush stdout")?;
        }
    }
    Ok(())
}

fn run_translate_page(runtime: &RuntimeOptions, args: TranslatePageArgs) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, Some(&args.flags))?;
    let index = load_history(&settings)?;
    let wanted = revision_number(&args.version)
        .ok_or_else(|| anyhow!("invalid revision number: {}", args.version))?;
    let page_name = escape_page_name(&args.page);
    let event = index
        .events()
        .iter()
        .find(|event| {
            event.page_name == page_name && revision_number(&event.revision_id) == Some(wanted)
        })
        .ok_or_else(|| anyhow!("no revision {} of {} in the history", args.version, args.page))?;

    let mut translator = build_translator(runtime, &settings, &args.flags, &index)?;
    match translator.translate(event)? {
        Content::Bytes(bytes) => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(&bytes)
                .context("failed to write to stdout")?;
            stdout.flush().context("failed to flush stdout")?;
        }
        Content::Tombstone => {
            println!("{} revision {} has no content (deleted)", args.page, args.version);
        }
    }
    Ok(())
}

fn run_history(runtime: &RuntimeOptions) -> Result<()> {
    let settings = resolve_runtime_settings(runtime, None)?;
    let index = load_history(&settings)?;
    let users = load_users(&settings)?;

    println!("history");
    println!(
        "data_dir: {}",
        normalize_for_display(&settings.data_dir.value)
    );
    println!("events: {}", index.len());
    for (kind, count) in index.kind_counts() {
        println!("events.{kind}: {count}");
    }
    for event in index.events() {
        println!(
            "{} {} {} rev {} by {}",
            event.epoch_seconds(),
            event.kind.as_str(),
            event.unescaped_page_name(),
            event.revision_id,
            users.resolve_author(&event.author_id).moin_name
        );
    }
    print_diagnostics(runtime, &settings);
    Ok(())
}

fn resolve_runtime_settings(
    runtime: &RuntimeOptions,
    flags: Option<&ExportFlags>,
) -> Result<ResolvedSettings> {
    dotenvy::dotenv().ok();
    let overrides = SettingOverrides {
        config: runtime.config.clone(),
        data_dir: runtime.data_dir.clone(),
        user_map: runtime.user_map.clone(),
        cache_dir: flags.and_then(|flags| flags.cache_dir.clone()),
        url_prefix: flags.and_then(|flags| flags.url_prefix.clone()),
        branch: flags.and_then(|flags| flags.branch.clone()),
    };
    resolve_settings(&overrides)
}

fn load_history(settings: &ResolvedSettings) -> Result<HistoryIndex> {
    let events = read_all_events(&settings.layout())?;
    Ok(HistoryIndex::build(events))
}

fn load_users(settings: &ResolvedSettings) -> Result<UserSet> {
    match &settings.user_map {
        Some(map) => UserSet::load_from_file(&map.value),
        None => UserSet::load_from_wiki_data(&settings.layout()),
    }
}

fn export_options(settings: &ResolvedSettings, flags: &ExportFlags) -> ExportOptions {
    ExportOptions {
        branch: settings.branch.value.clone(),
        home_page: settings.home_page && !flags.no_home_page,
        generated_at_micros: None,
    }
}

fn build_translator<'a>(
    runtime: &RuntimeOptions,
    settings: &ResolvedSettings,
    flags: &ExportFlags,
    index: &'a HistoryIndex,
) -> Result<Box<dyn Translate + 'a>> {
    if flags.raw {
        return Ok(Box::new(RawTranslator));
    }
    let cache = FetchCache::open(&settings.cache_dir.value, &runtime.proxies)?;
    let translator = RenderedTranslator::new(
        &settings.url_prefix.value,
        cache,
        PandocConverter::default(),
        index,
    )?;
    Ok(Box::new(translator))
}

fn revision_number(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

fn print_report(report: &ExportReport) {
    println!("events: {}", report.events);
    println!("home_page: {}", format_flag(report.home_page));
    println!("commits: {}", report.stream.commits);
    println!("blobs: {}", report.stream.blobs);
    println!("deletes: {}", report.stream.deletes);
    println!("renames: {}", report.stream.renames);
    println!("attachments: {}", report.stream.attachments);
}

fn print_diagnostics(runtime: &RuntimeOptions, settings: &ResolvedSettings) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", settings.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fast_export_parses_flags_and_destination() {
        let cli = Cli::try_parse_from([
            "moin2git",
            "--data-dir",
            "/srv/moin/data",
            "fast-export",
            "--raw",
            "--no-home-page",
            "--url-prefix",
            "https://wiki.example.org/",
            "out",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir.as_deref(), Some(Path::new("/srv/moin/data")));
        match cli.command {
            Some(Commands::FastExport(args)) => {
                assert!(args.flags.raw);
                assert!(args.flags.no_home_page);
                assert_eq!(
                    args.flags.url_prefix.as_deref(),
                    Some("https://wiki.example.org/")
                );
                assert_eq!(args.destination, PathBuf::from("out"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn fast_export_requires_destination() {
        assert!(Cli::try_parse_from(["moin2git", "fast-export"]).is_err());
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["moin2git", "history", "--verbose", "--diagnostics"])
            .expect("parse");
        assert!(cli.verbose);
        assert!(cli.diagnostics);
        assert!(matches!(cli.command, Some(Commands::History)));
    }

    #[test]
    fn translate_page_takes_page_and_version() {
        let cli = Cli::try_parse_from(["moin2git", "translate-page", "A/B", "3"]).expect("parse");
        match cli.command {
            Some(Commands::TranslatePage(args)) => {
                assert_eq!(args.page, "A/B");
                assert_eq!(args.version, "3");
                assert!(!args.flags.raw);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn proxies_repeat_and_log_file_defaults() {
        let cli = Cli::try_parse_from([
            "moin2git",
            "--proxy",
            "http://proxy-a:3128",
            "--proxy",
            "http://proxy-b:3128",
            "check",
        ])
        .expect("parse");
        assert_eq!(
            cli.proxy,
            vec![
                "http://proxy-a:3128".to_string(),
                "http://proxy-b:3128".to_string()
            ]
        );
        assert_eq!(cli.log_file, PathBuf::from(DEFAULT_LOG_FILE));
        assert_eq!(RuntimeOptions::from_cli(&cli).proxies.len(), 2);
    }

    #[test]
    fn log_level_follows_flags() {
        assert_eq!(log_level(true, true), Level::DEBUG);
        assert_eq!(log_level(false, true), Level::INFO);
        assert_eq!(log_level(false, false), Level::WARN);
    }

    #[test]
    fn revision_numbers_ignore_zero_padding() {
        assert_eq!(revision_number("00000003"), Some(3));
        assert_eq!(revision_number("3"), Some(3));
        assert_eq!(revision_number("x"), None);
    }
}
