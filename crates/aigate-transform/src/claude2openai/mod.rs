mod response;
mod stream;

pub use response::messages_to_chat;
pub use stream::{AnthropicStreamState, StreamControl, StreamMessageInfo, StreamUsageTotals};

use aigate_protocol::claude::StopReason;
use aigate_protocol::openai::FinishReason;

pub fn map_finish_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
        StopReason::EndTurn | StopReason::StopSequence | StopReason::PauseTurn | StopReason::Other => {
            FinishReason::Stop
        }
    }
}
