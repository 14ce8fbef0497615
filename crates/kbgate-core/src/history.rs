use kbgate_contracts::{Conversation, HistoryMessage, HistoryResponse, UpstreamHistoryItem};

/// Reshapes upstream sessions into OpenAI-style conversations. Each item
/// becomes a user/assistant pair; empty sessions are dropped but keep their
/// index in the conversation id.
pub fn build_history(sessions: Vec<Vec<UpstreamHistoryItem>>) -> HistoryResponse {
    let data = sessions
        .into_iter()
        .enumerate()
        .filter_map(|(index, session)| {
            let created = session.first()?.create_time / 1000;
            let messages = session
                .into_iter()
                .flat_map(|item| {
                    [
                        HistoryMessage { role: "user".to_string(), content: item.query },
                        HistoryMessage { role: "assistant".to_string(), content: item.answer },
                    ]
                })
                .collect();
            Some(Conversation {
                id: format!("conv_{index}"),
                object: "conversation".to_string(),
                created,
                messages,
            })
        })
        .collect();

    HistoryResponse { object: "list".to_string(), data }
}
