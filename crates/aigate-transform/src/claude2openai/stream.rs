use aigate_protocol::claude::{
    ErrorDetail, Role, StreamContentBlock, StreamDelta, StreamEvent, StreamUsage,
};
use aigate_protocol::openai::{
    CHUNK_OBJECT, ChatCompletionChunk, ChatRole, ChunkChoice, ChunkDelta, CompletionUsage,
    FinishReason, FunctionCallDelta, ToolCallDelta,
};

use super::map_finish_reason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl StreamUsageTotals {
    /// Vendor usage fields are cumulative, so present values replace.
    fn absorb(&mut self, usage: &StreamUsage) {
        if let Some(value) = usage.input_tokens {
            self.input_tokens = value;
        }
        if let Some(value) = usage.output_tokens {
            self.output_tokens = value;
        }
        if let Some(value) = usage.cache_read_input_tokens {
            self.cache_read_input_tokens = value;
        }
        if let Some(value) = usage.cache_creation_input_tokens {
            self.cache_creation_input_tokens = value;
        }
    }

    pub fn completion_usage(&self) -> CompletionUsage {
        CompletionUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// What one stream has told us so far that individual events do not repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessageInfo {
    pub id: String,
    pub model: String,
    pub role: ChatRole,
    pub usage: StreamUsageTotals,
}

#[derive(Debug, Clone)]
struct ToolSlot {
    block_index: u32,
    arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamControl {
    Chunk(ChatCompletionChunk),
    Error(ErrorDetail),
}

/// Converts Anthropic stream events into OpenAI chat-completion chunks.
///
/// One instance per stream; it is not meant to be shared.
#[derive(Debug, Clone)]
pub struct AnthropicStreamState {
    info: StreamMessageInfo,
    created: i64,
    tool_slots: Vec<ToolSlot>,
    finish_emitted: bool,
    completed: bool,
}

impl AnthropicStreamState {
    pub fn new(fallback_id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            info: StreamMessageInfo {
                id: fallback_id.into(),
                model: model.into(),
                role: ChatRole::Assistant,
                usage: StreamUsageTotals::default(),
            },
            created,
            tool_slots: Vec::new(),
            finish_emitted: false,
            completed: false,
        }
    }

    pub fn info(&self) -> &StreamMessageInfo {
        &self.info
    }

    /// True once the terminal event has been seen.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Accumulated tool-call arguments, by OpenAI tool-call index.
    pub fn tool_arguments(&self, slot: usize) -> Option<&str> {
        self.tool_slots.get(slot).map(|s| s.arguments.as_str())
    }

    pub fn transform_event(&mut self, event: StreamEvent) -> Option<StreamControl> {
        match event {
            StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.info.id = message.id;
                }
                if !message.model.is_empty() {
                    self.info.model = message.model;
                }
                self.info.role = match message.role {
                    Role::User => ChatRole::User,
                    Role::Assistant => ChatRole::Assistant,
                };
                self.info.usage.absorb(&message.usage);
                None
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.block_start(index, content_block).map(StreamControl::Chunk),
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.block_delta(index, delta).map(StreamControl::Chunk)
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => None,
            StreamEvent::MessageDelta { delta, usage } => {
                self.info.usage.absorb(&usage);
                let finish_reason = delta.stop_reason.map(map_finish_reason)?;
                self.finish_emitted = true;
                Some(StreamControl::Chunk(self.chunk(
                    ChunkDelta::default(),
                    Some(finish_reason),
                )))
            }
            StreamEvent::MessageStop => {
                self.completed = true;
                let mut chunk = if self.finish_emitted {
                    self.empty_chunk()
                } else {
                    self.finish_emitted = true;
                    self.chunk(ChunkDelta::default(), Some(FinishReason::Stop))
                };
                chunk.usage = Some(self.info.usage.completion_usage());
                Some(StreamControl::Chunk(chunk))
            }
            StreamEvent::Error { error } => Some(StreamControl::Error(error)),
        }
    }

    fn block_start(&mut self, index: u32, block: StreamContentBlock) -> Option<ChatCompletionChunk> {
        match block {
            StreamContentBlock::Text { text } => Some(self.chunk(
                ChunkDelta {
                    role: Some(self.info.role),
                    content: Some(text),
                    ..ChunkDelta::default()
                },
                None,
            )),
            StreamContentBlock::Thinking { thinking } => Some(self.chunk(
                ChunkDelta {
                    role: Some(self.info.role),
                    reasoning_content: (!thinking.is_empty()).then_some(thinking),
                    ..ChunkDelta::default()
                },
                None,
            )),
            StreamContentBlock::ToolUse { id, name, .. } => {
                let slot = self.tool_slots.len() as u32;
                self.tool_slots.push(ToolSlot {
                    block_index: index,
                    arguments: String::new(),
                });
                Some(self.chunk(
                    ChunkDelta {
                        role: Some(self.info.role),
                        tool_calls: Some(vec![ToolCallDelta {
                            index: slot,
                            id: Some(id),
                            r#type: Some("function".to_string()),
                            function: FunctionCallDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            },
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ))
            }
            StreamContentBlock::RedactedThinking { .. } | StreamContentBlock::Other => None,
        }
    }

    fn block_delta(&mut self, index: u32, delta: StreamDelta) -> Option<ChatCompletionChunk> {
        match delta {
            StreamDelta::TextDelta { text } => Some(self.chunk(
                ChunkDelta {
                    content: Some(text),
                    ..ChunkDelta::default()
                },
                None,
            )),
            StreamDelta::ThinkingDelta { thinking } => Some(self.chunk(
                ChunkDelta {
                    reasoning_content: Some(thinking),
                    ..ChunkDelta::default()
                },
                None,
            )),
            StreamDelta::InputJsonDelta { partial_json } => {
                let slot = self
                    .tool_slots
                    .iter()
                    .rposition(|slot| slot.block_index == index)?;
                self.tool_slots[slot].arguments.push_str(&partial_json);
                Some(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: slot as u32,
                            id: None,
                            r#type: None,
                            function: FunctionCallDelta {
                                name: None,
                                arguments: Some(partial_json),
                            },
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ))
            }
            StreamDelta::SignatureDelta { .. } | StreamDelta::Other => None,
        }
    }

    fn empty_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.info.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.info.model.clone(),
            choices: Vec::new(),
            usage: None,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        let mut chunk = self.empty_chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(raw: &[&str]) -> Vec<StreamEvent> {
        raw.iter().map(|line| serde_json::from_str(line).unwrap()).collect()
    }

    fn run(state: &mut AnthropicStreamState, raw: &[&str]) -> Vec<ChatCompletionChunk> {
        events(raw)
            .into_iter()
            .filter_map(|event| match state.transform_event(event) {
                Some(StreamControl::Chunk(chunk)) => Some(chunk),
                Some(StreamControl::Error(err)) => panic!("unexpected error {err:?}"),
                None => None,
            })
            .collect()
    }

    #[test]
    fn text_stream_reconstructs_content_and_usage() {
        let mut state = AnthropicStreamState::new("fallback", "requested", 1);
        let chunks = run(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"id":"msg_9","role":"assistant","model":"claude-x","content":[],"usage":{"input_tokens":25,"output_tokens":1}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"ping"}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo!"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert_eq!(chunks[0].choices[0].delta.role, Some(ChatRole::Assistant));
        let text: String = chunks
            .iter()
            .flat_map(|c| c.choices.iter())
            .filter_map(|choice| choice.delta.content.clone())
            .collect();
        assert_eq!(text, "Hello!");
        assert!(chunks.iter().all(|c| c.id == "msg_9" && c.model == "claude-x"));

        let finish: Vec<_> = chunks
            .iter()
            .flat_map(|c| c.choices.iter())
            .filter_map(|choice| choice.finish_reason)
            .collect();
        assert_eq!(finish, vec![FinishReason::Stop]);

        let last = chunks.last().unwrap();
        assert!(last.choices.is_empty());
        assert_eq!(last.usage, Some(CompletionUsage::new(25, 15)));
        assert_eq!(last.usage.unwrap().total_tokens, 40);
        assert!(state.is_completed());
    }

    #[test]
    fn tool_use_opens_sequential_slots_and_accumulates_arguments() {
        let mut state = AnthropicStreamState::new("fallback", "requested", 1);
        let chunks = run(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant","model":"m","usage":{"input_tokens":3}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"weather","input":{}}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"Oslo\"}"}}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        let start = chunks[1].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(start[0].index, 0);
        assert_eq!(start[0].id.as_deref(), Some("toolu_1"));
        assert_eq!(start[0].function.arguments.as_deref(), Some(""));
        assert_eq!(state.tool_arguments(0), Some(r#"{"city":"Oslo"}"#));
        assert_eq!(
            chunks[4].choices[0].finish_reason,
            Some(FinishReason::ToolCalls)
        );
    }

    #[test]
    fn stop_without_message_delta_still_finishes() {
        let mut state = AnthropicStreamState::new("call-1", "requested", 1);
        let chunks = run(&mut state, &[r#"{"type":"message_stop"}"#]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "call-1");
        assert_eq!(chunks[0].choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn vendor_error_is_surfaced() {
        let mut state = AnthropicStreamState::new("id", "m", 1);
        let event = serde_json::from_str(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap();
        assert!(matches!(
            state.transform_event(event),
            Some(StreamControl::Error(ErrorDetail { ref r#type, .. })) if r#type == "overloaded_error"
        ));
    }
}
