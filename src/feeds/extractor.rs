//! Turns archive commits into messages.
//!
//! A commit either carries exactly one RFC 2822 message blob or nothing of
//! interest. Anything that cannot be turned into a [`Message`] with a
//! Message-ID is logged and skipped; extraction problems are never fatal to
//! a run.

use tracing::{debug, warn};

use crate::domain::{CommitRef, Message};

use super::{FeedSource, Result};

/// Extracts the message carried by `commit`, if any.
pub async fn extract(feed: &dyn FeedSource, commit: &CommitRef) -> Result<Option<Message>> {
    let Some(raw) = feed.load_message(commit).await? else {
        debug!(feed = %feed.id(), commit = %commit, "commit carries no message blob");
        return Ok(None);
    };

    match Message::from_raw(raw) {
        Some(message) => {
            debug!(
                feed = %feed.id(),
                commit = %commit,
                msgid = %message.message_id(),
                "extracted message"
            );
            Ok(Some(message))
        }
        None => {
            warn!(
                feed = %feed.id(),
                commit = %commit,
                "skipping commit without a parseable message or Message-ID"
            );
            Ok(None)
        }
    }
}
