//! Thread-level entity propagation, as pure planning functions.
//!
//! A message with no direct entity reference becomes discoverable under an
//! entity's filter if anything in its thread mentions it. Propagation is
//! thread-scoped: mentions never leak across distinct threads in the same
//! channel.

use std::collections::BTreeMap;

use crate::domain::message::{
    normalize_mentions, EntityMention, MessageId, MessageRecord,
};

/// One pending overwrite of a message's thread-level mention set.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadUpdate {
    pub message_id: MessageId,
    pub thread_ts: String,
    pub thread_mentions: Vec<EntityMention>,
}

/// Group threaded messages by root timestamp. Unthreaded messages are their
/// own singleton group and are not returned here.
pub fn group_by_thread(messages: &[MessageRecord]) -> BTreeMap<String, Vec<&MessageRecord>> {
    let mut groups: BTreeMap<String, Vec<&MessageRecord>> = BTreeMap::new();
    for message in messages {
        if let Some(thread_ts) = &message.thread_ts {
            groups.entry(thread_ts.clone()).or_default().push(message);
        }
    }
    groups
}

/// Union of direct mentions across a thread's members.
pub fn union_mentions<'a>(members: impl IntoIterator<Item = &'a MessageRecord>) -> Vec<EntityMention> {
    normalize_mentions(
        members.into_iter().flat_map(|message| message.mentions.iter().cloned()).collect(),
    )
}

/// Compute the set of overwrites needed to bring every thread member's
/// thread-level mentions up to the thread union. Running this twice over the
/// same messages yields no updates the second time, because the first pass's
/// updates make every member current.
pub fn plan_updates(messages: &[MessageRecord]) -> Vec<ThreadUpdate> {
    let mut updates = Vec::new();

    for (thread_ts, members) in group_by_thread(messages) {
        if members.len() < 2 {
            continue;
        }

        let union = union_mentions(members.iter().copied());
        if union.is_empty() {
            continue;
        }

        for member in members {
            if member.thread_mentions != union {
                updates.push(ThreadUpdate {
                    message_id: member.id.clone(),
                    thread_ts: thread_ts.clone(),
                    thread_mentions: union.clone(),
                });
            }
        }
    }

    updates
}
