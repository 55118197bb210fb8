pub mod request;
pub mod response;
pub mod stream;

pub use request::*;
pub use response::*;
pub use stream::*;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
