//! In-memory conversation history keyed by `conversation_id`, so a caller
//! can pass `options.conversation_id` instead of resending the full turn
//! history on every request.

use kbretrieve_types::{ConversationTurn, TurnRole};
use std::collections::HashMap;
use std::sync::Mutex;

const MAX_TURNS_PER_CONVERSATION: usize = 50;

/// Bounded per-conversation turn history. Each conversation keeps at most
/// [`MAX_TURNS_PER_CONVERSATION`] turns, oldest dropped first.
#[derive(Default)]
pub struct SessionStore {
    conversations: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prior turns recorded for `conversation_id`, oldest first. Empty if
    /// the conversation is unknown.
    pub fn history(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Append the user's query to `conversation_id`'s history.
    pub fn record_query(&self, conversation_id: &str, query: &str) {
        self.append(
            conversation_id,
            ConversationTurn {
                role: TurnRole::User,
                content: query.to_string(),
                timestamp: chrono::Utc::now(),
            },
        );
    }

    fn append(&self, conversation_id: &str, turn: ConversationTurn) {
        let mut conversations = self.conversations.lock().unwrap();
        let turns = conversations.entry(conversation_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > MAX_TURNS_PER_CONVERSATION {
            let drop = turns.len() - MAX_TURNS_PER_CONVERSATION;
            turns.drain(0..drop);
        }
    }
}
