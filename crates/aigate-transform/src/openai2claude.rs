//! OpenAI chat-completions request to Anthropic Messages request.

use aigate_protocol::claude::{
    ContentBlock, ImageSource, Message, MessagesRequest, Metadata, Role, Thinking, Tool,
    ToolChoice, ToolResultContent,
};
use aigate_protocol::openai::{
    ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent, Tool as OpenAITool,
    ToolChoice as OpenAIToolChoice,
};
use serde_json::{Value, json};

use crate::ConvertError;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const MIN_THINKING_BUDGET: u32 = 1024;
/// Assistant text inserted when moving images out of the final assistant turn.
pub const FILLER_ASSISTANT_TEXT: &str = "OK.";

pub fn chat_to_messages(req: ChatCompletionRequest) -> Result<MessagesRequest, ConvertError> {
    if req.messages.is_empty() {
        return Err(ConvertError::EmptyMessages);
    }

    let max_tokens = req
        .max_completion_tokens
        .or(req.max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    let thinking = requested_thinking_budget(&req)
        .and_then(|budget| normalize_thinking_budget(budget, max_tokens))
        .map(|budget_tokens| Thinking::Enabled { budget_tokens });

    let mut system = Vec::new();
    let mut messages = Vec::new();
    for message in req.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content.map(|c| c.text()).unwrap_or_default();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            ChatRole::User => messages.extend(map_user_message(message)?),
            ChatRole::Assistant => messages.extend(map_assistant_message(message)?),
            ChatRole::Tool | ChatRole::Function => messages.push(map_tool_message(message)),
        }
    }

    let messages = merge_consecutive_roles(split_assistant_images(messages));
    let thinking_on = thinking.is_some();

    Ok(MessagesRequest {
        model: Some(req.model).filter(|model| !model.is_empty()),
        messages,
        system: if system.is_empty() {
            None
        } else {
            Some(system.join("\n"))
        },
        max_tokens,
        temperature: req.temperature.filter(|_| !thinking_on),
        top_p: req.top_p.filter(|_| !thinking_on),
        top_k: req.top_k.filter(|_| !thinking_on),
        stop_sequences: req.stop.map(|stop| stop.into_vec()).filter(|s| !s.is_empty()),
        stream: req.stream.filter(|stream| *stream),
        tools: req
            .tools
            .map(|tools| tools.into_iter().map(map_tool).collect::<Vec<_>>())
            .filter(|tools| !tools.is_empty()),
        tool_choice: req.tool_choice.and_then(map_tool_choice),
        thinking,
        metadata: req.user.map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
        anthropic_version: None,
    })
}

fn requested_thinking_budget(req: &ChatCompletionRequest) -> Option<u32> {
    if let Some(thinking) = &req.thinking {
        if thinking.r#type.as_deref() == Some("disabled") {
            return None;
        }
        if let Some(budget) = thinking.budget_tokens {
            return Some(budget);
        }
    }
    match req.reasoning_effort.as_deref()?.to_ascii_lowercase().as_str() {
        "minimal" | "low" => Some(1024),
        "medium" => Some(4096),
        "high" => Some(16384),
        _ => None,
    }
}

/// Raises the budget to the vendor floor and keeps it strictly below
/// `max_tokens`. Returns `None` when no valid budget fits.
pub fn normalize_thinking_budget(budget: u32, max_tokens: u32) -> Option<u32> {
    let mut budget = budget.max(MIN_THINKING_BUDGET);
    if budget >= max_tokens {
        budget = max_tokens.saturating_sub(1);
    }
    if budget < MIN_THINKING_BUDGET {
        return None;
    }
    Some(budget)
}

fn map_user_message(message: ChatMessage) -> Result<Option<Message>, ConvertError> {
    let blocks = match message.content {
        Some(content) => map_parts(content)?,
        None => Vec::new(),
    };
    Ok((!blocks.is_empty()).then_some(Message {
        role: Role::User,
        content: blocks,
    }))
}

fn map_assistant_message(message: ChatMessage) -> Result<Option<Message>, ConvertError> {
    let mut blocks = match message.content {
        Some(content) => map_parts(content)?,
        None => Vec::new(),
    };
    for call in message.tool_calls.unwrap_or_default() {
        let input = parse_tool_arguments(&call.id, &call.function.arguments)?;
        blocks.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }
    Ok((!blocks.is_empty()).then_some(Message {
        role: Role::Assistant,
        content: blocks,
    }))
}

fn map_tool_message(message: ChatMessage) -> Message {
    let tool_use_id = message
        .tool_call_id
        .or(message.name)
        .unwrap_or_default();
    let text = message.content.map(|c| c.text()).unwrap_or_default();
    Message {
        role: Role::User,
        content: vec![ContentBlock::ToolResult {
            tool_use_id,
            content: ToolResultContent::Text(text),
            is_error: None,
        }],
    }
}

fn parse_tool_arguments(id: &str, arguments: &str) -> Result<Value, ConvertError> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments).map_err(|source| ConvertError::InvalidToolArguments {
        id: id.to_string(),
        source,
    })
}

fn map_parts(content: MessageContent) -> Result<Vec<ContentBlock>, ConvertError> {
    let mut blocks = Vec::new();
    for part in content.into_parts() {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
            }
            ContentPart::ImageUrl { image_url } => blocks.push(ContentBlock::Image {
                source: image_source(&image_url.url)?,
            }),
            ContentPart::Unsupported => {}
        }
    }
    Ok(blocks)
}

pub fn image_source(url: &str) -> Result<ImageSource, ConvertError> {
    if url.starts_with("data:") {
        let (media_type, data) = parse_data_url(url).ok_or(ConvertError::InvalidDataUrl)?;
        return Ok(ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        });
    }
    Ok(ImageSource::Url {
        url: url.to_string(),
    })
}

/// Splits `data:<mime>;base64,<payload>` into mime type and payload.
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    if media_type.is_empty() || data.is_empty() {
        return None;
    }
    Some((media_type, data))
}

/// The vendor rejects images in assistant turns: move them into a user turn
/// right after the assistant turn they came from.
fn split_assistant_images(messages: Vec<Message>) -> Vec<Message> {
    let ended_with_assistant = matches!(messages.last(), Some(m) if m.role == Role::Assistant);
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role != Role::Assistant || !message.content.iter().any(ContentBlock::is_image) {
            out.push(message);
            continue;
        }
        let (images, rest): (Vec<_>, Vec<_>) =
            message.content.into_iter().partition(ContentBlock::is_image);
        if !rest.is_empty() {
            out.push(Message {
                role: Role::Assistant,
                content: rest,
            });
        }
        out.push(Message {
            role: Role::User,
            content: images,
        });
    }

    let now_ends_with_user = matches!(out.last(), Some(m) if m.role == Role::User);
    if ended_with_assistant && now_ends_with_user {
        out.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::text(FILLER_ASSISTANT_TEXT)],
        });
    }
    out
}

fn merge_consecutive_roles(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => last.content.extend(message.content),
            _ => out.push(message),
        }
    }
    out
}

fn map_tool(tool: OpenAITool) -> Tool {
    Tool {
        name: tool.function.name,
        description: tool.function.description,
        input_schema: tool
            .function
            .parameters
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    }
}

fn map_tool_choice(choice: OpenAIToolChoice) -> Option<ToolChoice> {
    match choice {
        OpenAIToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Any),
            "none" => Some(ToolChoice::None),
            _ => None,
        },
        OpenAIToolChoice::Named { function, .. } => Some(ToolChoice::Tool {
            name: function.name,
        }),
    }
}
