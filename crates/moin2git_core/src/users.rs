use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::filesystem::WikiLayout;

pub const ANONYMOUS_ID: &str = "0000000000.00.00000";
pub const ANONYMOUS_NAME: &str = "anonymous";
pub const ANONYMOUS_EMAIL: &str = "anonymous@example.org";
pub const DEFAULT_EMAIL: &str = "user@example.org";

/// Commit identity for one wiki account.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Identity {
    #[serde(default = "default_email")]
    pub email: String,
    pub moin_id: String,
    pub moin_name: String,
}

fn default_email() -> String {
    DEFAULT_EMAIL.to_string()
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            email: ANONYMOUS_EMAIL.to_string(),
            moin_id: ANONYMOUS_ID.to_string(),
            moin_name: ANONYMOUS_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserSet {
    by_id: BTreeMap<String, Identity>,
    by_name: BTreeMap<String, Identity>,
    fallback: Identity,
}

impl UserSet {
    /// Index identities by id and name; an `anonymous` entry is always present.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let mut by_id = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for identity in identities {
            by_id.insert(identity.moin_id.clone(), identity.clone());
            by_name.insert(identity.moin_name.clone(), identity);
        }
        let fallback = match by_name.get(ANONYMOUS_NAME) {
            Some(existing) => existing.clone(),
            None => {
                let anonymous = Identity::anonymous();
                by_id.insert(anonymous.moin_id.clone(), anonymous.clone());
                by_name.insert(anonymous.moin_name.clone(), anonymous.clone());
                anonymous
            }
        };
        Self {
            by_id,
            by_name,
            fallback,
        }
    }

    /// Read account files from the wiki's `user/` directory.
    pub fn load_from_wiki_data(layout: &WikiLayout) -> Result<Self> {
        let users_dir = layout.users_dir();
        debug!("loading wiki users from {}", users_dir.display());
        let mut identities = Vec::new();
        if users_dir.is_dir() {
            for entry in WalkDir::new(&users_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry =
                    entry.with_context(|| format!("failed to list {}", users_dir.display()))?;
                let moin_id = entry.file_name().to_string_lossy().into_owned();
                if !entry.file_type().is_file() || !is_user_id(&moin_id) {
                    continue;
                }
                let Ok(content) = fs::read_to_string(entry.path()) else {
                    debug!("skipping unreadable user file {}", entry.path().display());
                    continue;
                };
                if let Some(identity) = parse_user_file(&moin_id, &content) {
                    debug!("user added: {}", identity.moin_name);
                    identities.push(identity);
                }
            }
        }
        Ok(Self::from_identities(identities))
    }

    /// Read a user map previously written by [`UserSet::save_to_file`].
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let identities: Vec<Identity> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Self::from_identities(identities))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let identities = self.by_name.values().collect::<Vec<_>>();
        let rendered =
            serde_json::to_string_pretty(&identities).context("failed to serialize user map")?;
        fs::write(path, format!("{rendered}\n"))
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Identity> {
        self.by_name.get(name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Identity> {
        self.by_id.get(id)
    }

    /// Identity for a legacy author id, falling back to `anonymous`.
    pub fn resolve_author(&self, id: &str) -> &Identity {
        self.by_id.get(id).unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn is_user_id(value: &str) -> bool {
    let parts = value.split('.').collect::<Vec<_>>();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit()))
}

fn parse_user_file(moin_id: &str, content: &str) -> Option<Identity> {
    let mut name = None;
    let mut email = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.is_empty() || !key.bytes().all(|byte| byte.is_ascii_lowercase() || byte == b'_') {
            continue;
        }
        match key {
            "name" => name = Some(value.to_string()),
            "email" => email = Some(sanitize_email(value)),
            _ => {}
        }
    }
    Some(Identity {
        email: email
            .filter(|value| !value.is_empty())
            .unwrap_or_else(default_email),
        moin_id: moin_id.to_string(),
        moin_name: name?,
    })
}

fn sanitize_email(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '@' | '.' | '_' | '-'))
        .collect()
}
