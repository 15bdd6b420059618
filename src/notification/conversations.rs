use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use super::{Direction, MessageRecord, RecordId};

/// One line of the conversation list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub contact_id: RecordId,
    pub contact_name: Option<String>,
    /// Newest message exchanged with the contact
    pub last_message: MessageRecord,
    /// Received messages from the contact not yet read
    pub unread: usize,
}

/// Newest first; equal timestamps fall back to the greater record id
fn newer(a: &MessageRecord, b: &MessageRecord) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Collapse a flat message list into one summary per contact.
///
/// The result does not depend on input order: summaries come newest first,
/// ties broken by contact id.
pub fn group_conversations(messages: &[MessageRecord]) -> Vec<ConversationSummary> {
    let mut by_contact: HashMap<&RecordId, ConversationSummary> = HashMap::new();

    for message in messages {
        let unread = usize::from(message.direction == Direction::Received && !message.is_read);

        match by_contact.get_mut(&message.contact_id) {
            Some(summary) => {
                summary.unread += unread;
                if newer(message, &summary.last_message) == Ordering::Greater {
                    summary.last_message = message.clone();
                }
                if summary.contact_name.is_none() {
                    summary.contact_name = message.contact_name.clone();
                }
            }
            None => {
                by_contact.insert(
                    &message.contact_id,
                    ConversationSummary {
                        contact_id: message.contact_id.clone(),
                        contact_name: message.contact_name.clone(),
                        last_message: message.clone(),
                        unread,
                    },
                );
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = by_contact.into_values().collect();
    summaries.sort_by(|a, b| {
        newer(&b.last_message, &a.last_message).then_with(|| a.contact_id.cmp(&b.contact_id))
    });
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: u64, contact: u64, direction: Direction, secs: i64, is_read: bool) -> MessageRecord {
        MessageRecord {
            id: RecordId::from(id),
            contact_id: RecordId::from(contact),
            contact_name: Some(format!("contact-{}", contact)),
            direction,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            is_read,
            content: format!("message {}", id),
        }
    }

    #[test]
    fn test_groups_by_contact_newest_first() {
        let messages = vec![
            message(1, 10, Direction::Received, 0, false),
            message(2, 20, Direction::Received, 5, false),
            message(3, 10, Direction::Sent, 10, true),
            message(4, 10, Direction::Received, 3, false),
        ];

        let summaries = group_conversations(&messages);
        assert_eq!(summaries.len(), 2);

        assert_eq!(summaries[0].contact_id, RecordId::from(10u64));
        assert_eq!(summaries[0].last_message.id, RecordId::from(3u64));
        assert_eq!(summaries[0].unread, 2);

        assert_eq!(summaries[1].contact_id, RecordId::from(20u64));
        assert_eq!(summaries[1].unread, 1);
    }

    #[test]
    fn test_equal_timestamps_break_on_greater_id() {
        let forward = vec![
            message(7, 10, Direction::Received, 0, true),
            message(9, 10, Direction::Received, 0, true),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        for input in [forward, backward] {
            let summaries = group_conversations(&input);
            assert_eq!(summaries[0].last_message.id, RecordId::from(9u64));
        }
    }

    #[test]
    fn test_mixed_id_kinds_pick_same_winner_in_any_order() {
        let at = |id: &str| MessageRecord {
            id: RecordId::from(id),
            ..message(0, 10, Direction::Received, 0, true)
        };
        let permutations = [
            ["2", "10", "1a"],
            ["2", "1a", "10"],
            ["10", "2", "1a"],
            ["10", "1a", "2"],
            ["1a", "2", "10"],
            ["1a", "10", "2"],
        ];

        for order in permutations {
            let messages: Vec<MessageRecord> = order.iter().map(|id| at(*id)).collect();
            let summaries = group_conversations(&messages);
            assert_eq!(summaries[0].last_message.id, RecordId::from("1a"), "input order {:?}", order);
        }
    }

    #[test]
    fn test_contact_order_is_total() {
        let messages = vec![
            message(1, 30, Direction::Received, 0, true),
            message(2, 20, Direction::Received, 0, true),
        ];
        let summaries = group_conversations(&messages);
        // Same timestamp: message ids decide, then contact ids
        assert_eq!(summaries[0].contact_id, RecordId::from(20u64));
    }

    #[test]
    fn test_empty_input() {
        assert!(group_conversations(&[]).is_empty());
    }
}
