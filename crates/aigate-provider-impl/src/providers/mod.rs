pub mod anthropic;
pub mod bedrock;
pub mod vertex;

pub use anthropic::{ANTHROPIC_DIRECTOR, AnthropicDirector};
pub use bedrock::{BEDROCK_DIRECTOR, BedrockDirector};
pub use vertex::{VERTEX_DIRECTOR, VertexDirector, VertexTokenCache};
