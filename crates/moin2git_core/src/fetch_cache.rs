use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::Proxy;
use reqwest::blocking::Client;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_DIR: &str = "_cache";
const CACHE_DB_FILENAME: &str = "fetch-cache.db";
const DEFAULT_USER_AGENT: &str = "moin2git/0.2";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 350;
/// Body stored when a page cannot be fetched at all.
const UNREACHABLE_BODY: &str = "\n";

/// Source of rendered page text for a URL.
pub trait Fetch {
    fn fetch(&mut self, url: &str) -> Result<String>;
}

/// URL-keyed memo of fetched pages, persisted in SQLite so reruns of an export
/// never hit the wiki server twice for the same revision.
pub struct FetchCache {
    cache_dir: PathBuf,
    connection: Connection,
    http: HttpFetcher,
}

impl FetchCache {
    /// Opens (or creates) the cache. `proxies` are URLs every wiki request is
    /// routed through; empty means a direct connection.
    pub fn open(cache_dir: &Path, proxies: &[String]) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;
        let db_path = cache_dir.join(CACHE_DB_FILENAME);
        let connection = open_connection(&db_path)?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS fetch_cache (
                    url TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    fetched_at_unix INTEGER NOT NULL
                );",
            )
            .context("failed to create fetch_cache table")?;
        debug!("fetch cache at {}", db_path.display());
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            connection,
            http: HttpFetcher::from_env(proxies)?,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn lookup(&self, url: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT body FROM fetch_cache WHERE url = ?1",
                [url],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read cached entry for {url}"))
    }

    pub fn store(&self, url: &str, body: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO fetch_cache (url, body, fetched_at_unix) VALUES (?1, ?2, ?3)
                 ON CONFLICT(url) DO UPDATE SET body = excluded.body,
                     fetched_at_unix = excluded.fetched_at_unix",
                params![url, body, unix_timestamp()?],
            )
            .with_context(|| format!("failed to cache {url}"))?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM fetch_cache", [], |row| row.get(0))
            .context("failed to count fetch cache entries")?;
        usize::try_from(count).context("fetch cache count does not fit into usize")
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Fetch for FetchCache {
    fn fetch(&mut self, url: &str) -> Result<String> {
        if let Some(body) = self.lookup(url)? {
            debug!("retrieved {url} from cache");
            return Ok(body);
        }
        debug!("fetching {url}");
        let body = match self.http.get(url) {
            Ok(body) => body,
            Err(error) => {
                warn!("no response to {url}: {error:#}");
                UNREACHABLE_BODY.to_string()
            }
        };
        self.store(url, &body)?;
        Ok(body)
    }
}

struct HttpFetcher {
    client: Client,
    user_agent: String,
    retries: usize,
    retry_delay_ms: u64,
}

impl HttpFetcher {
    fn from_env(proxies: &[String]) -> Result<Self> {
        let timeout_ms = env::var("MOIN2GIT_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let retries = env::var("MOIN2GIT_HTTP_RETRIES")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_RETRIES);
        let user_agent =
            env::var("MOIN2GIT_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        let mut builder = Client::builder().timeout(Duration::from_millis(timeout_ms));
        for proxy in proxies {
            let proxy = proxy.trim();
            if proxy.is_empty() {
                continue;
            }
            debug!("using proxy {proxy}");
            builder = builder
                .proxy(Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self {
            client,
            user_agent,
            retries,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        })
    }

    fn get(&self, url: &str) -> Result<String> {
        let mut last_error = None::<String>;
        for attempt in 0..=self.retries {
            let response = self
                .client
                .get(url)
                .header("User-Agent", self.user_agent.clone())
                .send();
            match response {
                Ok(response) if response.status().is_success() => {
                    return response
                        .text()
                        .with_context(|| format!("failed to read body of {url}"));
                }
                Ok(response) => last_error = Some(format!("HTTP {}", response.status())),
                Err(error) => last_error = Some(error.to_string()),
            }
            if attempt < self.retries {
                sleep(Duration::from_millis(
                    self.retry_delay_ms.saturating_mul(attempt as u64 + 1),
                ));
            }
        }
        let message = last_error.unwrap_or_else(|| "request failed".to_string());
        bail!("{message}")
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("unix timestamp does not fit into i64")
}
