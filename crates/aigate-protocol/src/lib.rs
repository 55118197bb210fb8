//! Wire types shared by the gateway: the canonical OpenAI-compatible surface,
//! the Anthropic Messages API, Gemini content parts, and the two stream framings
//! vendors use (SSE text and AWS binary event-stream).

pub mod claude;
pub mod eventstream;
pub mod gemini;
pub mod openai;
pub mod sse;
