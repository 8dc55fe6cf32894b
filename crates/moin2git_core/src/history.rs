use std::collections::{BTreeMap, HashMap, HashSet};

use crate::edit_log::{EditEvent, EditKind};
use crate::filesystem::{
    PATH_SEPARATOR_TOKEN, attachment_export_path, export_path, unescape_page_name,
};
use crate::users::Identity;

pub const HOME_PAGE_NAME: &str = "Home";
pub const HOME_PAGE_REVISION: &str = "00000000";
pub const HOME_AUTHOR_NAME: &str = "moin2git";
pub const HOME_AUTHOR_EMAIL: &str = "moin2git@example.org";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct AttachmentKey {
    page_name: String,
    attachment_name: String,
}

/// All events of the wiki in commit order plus the final-state lookup tables.
///
/// Built once; the tables describe where every page and attachment lives at the
/// end of the history, which is what link rewriting needs regardless of where a
/// given revision sits in the timeline.
#[derive(Debug, Clone, Default)]
pub struct HistoryIndex {
    events: Vec<EditEvent>,
    latest_by_page_name: HashMap<String, usize>,
    latest_attachment_by_key: HashMap<AttachmentKey, usize>,
}

/// The synthesized landing page, ready to be written as one more commit.
#[derive(Debug, Clone)]
pub struct HomePage {
    pub event: EditEvent,
    pub author: Identity,
    pub content: String,
}

impl HistoryIndex {
    /// Orders events by timestamp. `sort_by_key` is stable, so equal timestamps
    /// keep the order they were read in (directory order, then log order).
    pub fn build(mut events: Vec<EditEvent>) -> Self {
        events.sort_by_key(|event| event.timestamp_micros);

        let mut latest_by_page_name = HashMap::new();
        let mut latest_attachment_by_key = HashMap::new();
        for (position, event) in events.iter().enumerate() {
            match &event.kind {
                EditKind::PageSave => {
                    latest_by_page_name.insert(event.unescaped_page_name(), position);
                }
                EditKind::Rename { previous_page_name } => {
                    latest_by_page_name.insert(event.unescaped_page_name(), position);
                    if previous_page_name != &event.page_name {
                        latest_by_page_name
                            .insert(unescape_page_name(previous_page_name), position);
                    }
                }
                EditKind::Attach { attachment_name } => {
                    latest_attachment_by_key.insert(
                        AttachmentKey {
                            page_name: event.unescaped_page_name(),
                            attachment_name: attachment_name.clone(),
                        },
                        position,
                    );
                }
                EditKind::Delete => {}
            }
        }

        Self {
            events,
            latest_by_page_name,
            latest_attachment_by_key,
        }
    }

    pub fn events(&self) -> &[EditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest_for_page(&self, unescaped_page_name: &str) -> Option<&EditEvent> {
        self.latest_by_page_name
            .get(unescaped_page_name)
            .map(|position| &self.events[*position])
    }

    /// Export path of the page's final location, `None` if the name never existed.
    pub fn resolve(&self, unescaped_page_name: &str) -> Option<String> {
        self.latest_for_page(unescaped_page_name)
            .map(EditEvent::export_path)
    }

    pub fn resolve_attachment(
        &self,
        unescaped_page_name: &str,
        attachment_name: &str,
    ) -> Option<String> {
        let key = AttachmentKey {
            page_name: unescaped_page_name.to_string(),
            attachment_name: attachment_name.to_string(),
        };
        self.latest_attachment_by_key.get(&key).map(|position| {
            let event = &self.events[*position];
            attachment_export_path(&event.page_name, attachment_name)
        })
    }

    /// Escaped names of pages that still sit at their own location, i.e. not
    /// renamed away. Sorted segment by segment (unescaped), so a page's
    /// children follow it directly.
    pub fn page_names(&self) -> Vec<String> {
        let mut names = self
            .latest_by_page_name
            .iter()
            .filter_map(|(unescaped, position)| {
                let event = &self.events[*position];
                (event.unescaped_page_name() == *unescaped).then(|| event.page_name.clone())
            })
            .collect::<Vec<_>>();
        names.sort_by_key(|name| page_segments(name));
        names
    }

    /// Bullet outline of every page, nested by path segment. A wiki page
    /// named like the generated home page is left out since its file is
    /// replaced.
    pub fn home_page_outline(&self) -> String {
        let mut emitted = HashSet::<Vec<String>>::new();
        let mut out = String::new();
        for name in self.page_names() {
            if name == HOME_PAGE_NAME {
                continue;
            }
            let segments = page_segments(&name);
            for depth in 0..segments.len() {
                let prefix = segments[..=depth].to_vec();
                if !emitted.insert(prefix) {
                    continue;
                }
                let indent = "  ".repeat(depth);
                let label = &segments[depth];
                if depth + 1 == segments.len() {
                    let target = export_path(&name);
                    out.push_str(&format!("{indent}* [{label}]({target})\n"));
                } else {
                    out.push_str(&format!("{indent}* {label}\n"));
                }
            }
        }
        out
    }

    pub fn home_page(&self, timestamp_micros: i64) -> HomePage {
        let content = format!("# {HOME_PAGE_NAME}\n\n{}", self.home_page_outline());
        HomePage {
            event: EditEvent {
                timestamp_micros,
                revision_id: HOME_PAGE_REVISION.to_string(),
                kind: EditKind::PageSave,
                page_name: HOME_PAGE_NAME.to_string(),
                comment: String::new(),
                author_id: String::new(),
                source_page_dir: Default::default(),
            },
            author: Identity {
                moin_id: String::new(),
                moin_name: HOME_AUTHOR_NAME.to_string(),
                email: HOME_AUTHOR_EMAIL.to_string(),
            },
            content,
        }
    }

    /// Event counts keyed by kind name.
    pub fn kind_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.kind.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

fn page_segments(escaped_page_name: &str) -> Vec<String> {
    escaped_page_name
        .split(PATH_SEPARATOR_TOKEN)
        .map(unescape_page_name)
        .collect()
}
