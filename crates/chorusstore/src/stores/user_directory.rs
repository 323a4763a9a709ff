use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{StoreContext, StreamSource};
use crate::database::{Database, UserDirectoryEntry};
use crate::error::Result;
use crate::stream_id::StreamIdGenerator;
use crate::types::{get_localpart_from_id, StreamToken};

/// Outcome of a directory search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    /// More matches existed than were returned.
    pub limited: bool,
    pub results: Vec<UserDirectoryEntry>,
}

/// Searchable directory of user profiles.
///
/// Its processing position is tracked against the events stream, so it
/// borrows the events allocator rather than owning one.
pub struct UserDirectoryStore {
    db: Arc<dyn Database>,
    events_stream: StreamIdGenerator,
    enabled: bool,
    search_all_users: bool,
}

impl UserDirectoryStore {
    pub async fn new(
        ctx: &StoreContext,
        events_stream: StreamIdGenerator,
        enabled: bool,
        search_all_users: bool,
    ) -> Result<Self> {
        let pos = ctx.db.user_directory_stream_pos().await?;
        info!(enabled, search_all_users, stream_pos = ?pos, "user directory store ready");

        Ok(Self {
            db: Arc::clone(&ctx.db),
            events_stream,
            enabled,
            search_all_users,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn search_all_users(&self) -> bool {
        self.search_all_users
    }

    /// Writes below are skipped while the directory is disabled.
    pub async fn update_profile_in_user_dir(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        if !self.enabled {
            debug!(user_id, "user directory disabled, profile update skipped");
            return Ok(());
        }
        let entry = UserDirectoryEntry {
            user_id: user_id.to_string(),
            display_name: display_name.map(str::to_string),
            avatar_url: avatar_url.map(str::to_string),
        };
        self.db.upsert_user_directory_entry(&entry).await?;
        Ok(())
    }

    pub async fn add_users_in_public_rooms(&self, room_id: &str, user_ids: &[&str]) -> Result<()> {
        if !self.enabled {
            debug!(room_id, users = user_ids.len(), "user directory disabled, public room update skipped");
            return Ok(());
        }
        let user_ids: Vec<String> = user_ids.iter().map(|u| u.to_string()).collect();
        self.db.add_users_in_public_room(room_id, &user_ids).await?;
        Ok(())
    }

    pub async fn get_users_in_public_rooms(&self) -> Result<Vec<(String, String)>> {
        Ok(self.db.users_in_public_rooms().await?)
    }

    pub async fn delete_all_from_user_dir(&self) -> Result<()> {
        self.db.delete_all_from_user_dir().await?;
        info!("user directory cleared");
        Ok(())
    }

    pub async fn get_user_directory_stream_pos(&self) -> Result<Option<StreamToken>> {
        Ok(self.db.user_directory_stream_pos().await?)
    }

    /// `None` marks the directory as needing a full rebuild.
    pub async fn update_user_directory_stream_pos(&self, pos: Option<StreamToken>) -> Result<()> {
        self.db.set_user_directory_stream_pos(pos).await?;
        debug!(stream_pos = ?pos, "user directory stream position updated");
        Ok(())
    }

    /// Record that every event visible right now has been processed.
    /// Returns the position, which is not persisted while disabled.
    pub async fn mark_caught_up(&self) -> Result<StreamToken> {
        let pos = self.events_stream.current_token();
        if !self.enabled {
            debug!(stream_pos = %pos, "user directory disabled, position not recorded");
            return Ok(pos);
        }
        self.update_user_directory_stream_pos(Some(pos)).await?;
        Ok(pos)
    }

    /// Search by user id localpart or display name.
    ///
    /// Every whitespace-separated word of `term` must prefix-match a word of
    /// the localpart or display name, ignoring case. Unless `search_all_users`
    /// is set, only users sharing a public room with someone are visible.
    pub async fn search_user_dir(&self, searcher: &str, term: &str, limit: usize) -> Result<SearchResults> {
        let terms: Vec<String> = term.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() || !self.enabled {
            return Ok(SearchResults {
                limited: false,
                results: Vec::new(),
            });
        }

        let visible: Option<HashSet<String>> = if self.search_all_users {
            None
        } else {
            Some(
                self.db
                    .users_in_public_rooms()
                    .await?
                    .into_iter()
                    .map(|(user_id, _)| user_id)
                    .collect(),
            )
        };

        let mut matches: Vec<UserDirectoryEntry> = self
            .db
            .user_directory_entries()
            .await?
            .into_iter()
            .filter(|entry| visible.as_ref().map_or(true, |v| v.contains(&entry.user_id)))
            .filter(|entry| entry_matches(entry, &terms))
            .collect();
        matches.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let limited = matches.len() > limit;
        matches.truncate(limit);

        debug!(searcher, term, found = matches.len(), limited, "user directory search");
        Ok(SearchResults {
            limited,
            results: matches,
        })
    }
}

fn entry_matches(entry: &UserDirectoryEntry, terms: &[String]) -> bool {
    let mut words: Vec<String> = Vec::new();
    if let Some(localpart) = get_localpart_from_id(&entry.user_id) {
        words.push(localpart.to_lowercase());
    }
    if let Some(name) = &entry.display_name {
        words.extend(name.split_whitespace().map(str::to_lowercase));
    }
    terms
        .iter()
        .all(|term| words.iter().any(|word| word.starts_with(term.as_str())))
}

impl StreamSource for UserDirectoryStore {
    fn generators(&self) -> Vec<&StreamIdGenerator> {
        Vec::new()
    }
}

impl std::fmt::Debug for UserDirectoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDirectoryStore")
            .field("enabled", &self.enabled)
            .field("search_all_users", &self.search_all_users)
            .finish()
    }
}
