//! Canned OpenAI-style backend payloads.

use llm_gateway_common::{
    ChatCompletionChunk, ChatCompletionResponse, ChatMessage, ChunkChoice, Delta, Usage,
    STREAM_DONE,
};

/// A complete non-streaming response carrying `content`.
pub fn completion(model: &str, content: &str) -> ChatCompletionResponse {
    ChatCompletionResponse::new(
        model.to_string(),
        ChatMessage::new("assistant", content),
        Some("stop".to_string()),
    )
    .with_usage(10, content.split_whitespace().count() as u32)
}

/// One stream chunk; the last one of a stream carries `finish_reason` and usage.
pub fn chunk(model: &str, content: &str, usage: Option<Usage>) -> ChatCompletionChunk {
    let finish_reason = usage.map(|_| "stop".to_string());
    ChatCompletionChunk {
        id: "chatcmpl-mock".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 0,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta {
                role: Some("assistant".to_string()),
                content: Some(content.to_string()),
            },
            finish_reason,
        }],
        usage,
    }
}

/// Usage reporting one completion token per chunk.
pub fn stream_usage(chunks: usize) -> Usage {
    Usage {
        prompt_tokens: 0,
        completion_tokens: chunks as u32,
        total_tokens: chunks as u32,
    }
}

/// JSON for each chunk of a clean stream over `parts`.
pub fn chunk_payloads(model: &str, parts: &[&str]) -> Vec<String> {
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let usage = (i + 1 == parts.len()).then(|| stream_usage(parts.len()));
            serde_json::to_string(&chunk(model, part, usage)).unwrap()
        })
        .collect()
}

/// A complete `text/event-stream` body, `[DONE]` included.
pub fn sse_body(model: &str, parts: &[&str]) -> String {
    let mut body: String = chunk_payloads(model, parts)
        .into_iter()
        .map(|payload| format!("data: {}\n\n", payload))
        .collect();
    body.push_str(&format!("data: {}\n\n", STREAM_DONE));
    body
}

/// An event-stream body cut off after `parts`, with no completion marker.
pub fn truncated_sse_body(model: &str, parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| {
            let payload = serde_json::to_string(&chunk(model, part, None)).unwrap();
            format!("data: {}\n\n", payload)
        })
        .collect()
}
