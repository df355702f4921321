//! Prompt construction for the multi-turn rewrite call.

use kbretrieve_types::{ConversationTurn, TurnRole};

/// Build the rewrite prompt from the bounded conversation history and the
/// latest user query. Instructs the model to resolve pronouns/ellipsis
/// against the history and propose query-expansion variants, responding
/// with a single JSON object so the caller can parse it deterministically.
pub fn build_prompt(history: &[ConversationTurn], query: &str) -> String {
    let mut prompt = String::from(
        "You rewrite a user's latest message into a standalone search query, \
        resolving pronouns and implicit references against the conversation \
        history below. You also propose up to 3 alternative phrasings that \
        would retrieve the same information. Respond with ONLY a JSON object \
        of the form {\"rewritten\": string, \"variants\": [string], \
        \"confidence\": number between 0 and 1}. Do not include any other text.\n\n\
        Conversation history:\n",
    );

    for turn in history {
        let role = match turn.role {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
        };
        prompt.push_str(&format!("{}: {}\n", role, turn.content));
    }

    prompt.push_str(&format!("\nLatest message: {}\n", query));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn prompt_includes_history_and_latest_message() {
        let history = vec![ConversationTurn {
            role: TurnRole::User,
            content: "what is bm25?".to_string(),
            timestamp: Utc::now(),
        }];
        let prompt = build_prompt(&history, "how is it different from tf-idf?");
        assert!(prompt.contains("what is bm25?"));
        assert!(prompt.contains("how is it different from tf-idf?"));
    }
}
