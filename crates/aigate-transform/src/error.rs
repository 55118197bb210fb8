#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("request has no messages")]
    EmptyMessages,
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("tool call {id} has invalid JSON arguments: {source}")]
    InvalidToolArguments {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid data url for image content")]
    InvalidDataUrl,
}
