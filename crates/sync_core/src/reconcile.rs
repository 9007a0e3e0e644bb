//! Folds authoritative message rows into optimistic local entries.

use shared::protocol::MessageRow;

use crate::{Message, MessageStatus};

/// Field agreements (out of content, kind, media url) required before a row
/// without a usable `client_id` is treated as the same logical message.
pub const HEURISTIC_MATCH_THRESHOLD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    ByClientId { index: usize },
    ByHeuristic { index: usize, score: u8 },
    NoMatch,
}

/// Matches an incoming authoritative row against the local message list.
///
/// A non-empty `client_id` is authoritative on its own. Rows written through
/// paths that predate the idempotency key fall back to scoring candidates
/// that still carry a `temp_id`, are still `Sending`, and share the row's
/// sender; below the threshold the row is treated as new rather than
/// guess-matched.
pub fn match_incoming(entries: &[Message], row: &MessageRow) -> MatchOutcome {
    if let Some(client_id) = row.client_id.as_ref().filter(|id| !id.as_str().is_empty()) {
        if let Some(index) = entries
            .iter()
            .position(|entry| entry.client_id.as_ref() == Some(client_id))
        {
            return MatchOutcome::ByClientId { index };
        }
    }

    let mut best: Option<(usize, u8)> = None;
    for (index, entry) in entries.iter().enumerate() {
        if entry.temp_id.is_none()
            || entry.status != MessageStatus::Sending
            || entry.sender_id != row.sender_id
        {
            continue;
        }
        let mut score = 0u8;
        if entry.content == row.content {
            score += 1;
        }
        if entry.kind == row.kind {
            score += 1;
        }
        if media_url_agrees(entry.media_url.as_deref(), row.media_url.as_deref()) {
            score += 1;
        }
        if score >= HEURISTIC_MATCH_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((index, score));
        }
    }

    match best {
        Some((index, score)) => MatchOutcome::ByHeuristic { index, score },
        None => MatchOutcome::NoMatch,
    }
}

/// Both-absent media counts as agreement.
fn media_url_agrees(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("") == b.unwrap_or("")
}

/// Replaces an optimistic entry with the authoritative row in place,
/// preserving its position in the list. The `temp_id` is discarded; status
/// advances to at least `floor` and never regresses.
pub fn fold_row(entry: &mut Message, row: &MessageRow, floor: MessageStatus) {
    entry.id = Some(row.id.clone());
    entry.temp_id = None;
    if entry.client_id.is_none() {
        entry.client_id = row.client_id.clone();
    }
    entry.content = row.content.clone();
    entry.kind = row.kind;
    entry.media_url = row.media_url.clone();
    entry.reply_to_message_id = row.reply_to_message_id.clone();
    entry.reply_to = row.reply_to.clone();
    entry.created_at = row.created_at;
    entry.status = entry.status.advanced_to(floor);
    entry.upload_progress = None;
}
