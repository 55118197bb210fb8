use aigate_protocol::claude::{ContentBlock, MessagesResponse};
use aigate_protocol::openai::{
    COMPLETION_OBJECT, ChatCompletionChoice, ChatCompletionResponse, ChatRole, CompletionUsage,
    FunctionCall, ResponseMessage, ToolCall,
};

use super::map_finish_reason;

pub fn messages_to_chat(resp: MessagesResponse, created: i64) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                r#type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    ChatCompletionResponse {
        id: resp.id,
        object: COMPLETION_OBJECT.to_string(),
        created,
        model: resp.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ResponseMessage {
                role: ChatRole::Assistant,
                content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: resp.stop_reason.map(map_finish_reason),
        }],
        usage: Some(CompletionUsage::new(
            resp.usage.input_tokens,
            resp.usage.output_tokens,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_protocol::openai::FinishReason;
    use serde_json::json;

    #[test]
    fn maps_text_tools_and_usage() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-x",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "s"},
                {"type": "text", "text": "Calling."},
                {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 7}
        }))
        .unwrap();

        let chat = messages_to_chat(resp, 1700000000);
        let choice = &chat.choices[0];
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(choice.message.content.as_deref(), Some("Calling."));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(chat.usage.unwrap().total_tokens, 17);
    }
}
