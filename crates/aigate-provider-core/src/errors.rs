use std::error::Error;
use std::fmt;

use aigate_transform::template::TemplateError;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The downstream payload cannot be served as sent.
    InvalidRequest(String),
    Unauthorized(String),
    NotFound(String),
    /// Static misconfiguration: unresolvable route config, empty host, bad filter config.
    InvalidConfig(String),
    MissingCredentialField(&'static str),
    Template(TemplateError),
    Signing(String),
    /// The upstream exchange failed or produced something we cannot translate.
    Upstream(String),
}

impl ProviderError {
    pub fn status(&self) -> u16 {
        match self {
            ProviderError::InvalidRequest(_) => 400,
            ProviderError::Unauthorized(_) => 401,
            ProviderError::NotFound(_) => 404,
            ProviderError::InvalidConfig(_)
            | ProviderError::MissingCredentialField(_)
            | ProviderError::Template(_)
            | ProviderError::Signing(_) => 500,
            ProviderError::Upstream(_) => 502,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::InvalidConfig(_) => "invalid_config",
            ProviderError::MissingCredentialField(_) => "missing_credential",
            ProviderError::Template(_) => "template_unresolved",
            ProviderError::Signing(_) => "signing_failed",
            ProviderError::Upstream(_) => "upstream_error",
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ProviderError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            ProviderError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ProviderError::MissingCredentialField(field) => {
                write!(f, "missing credential field: {field}")
            }
            ProviderError::Template(err) => write!(f, "template: {err}"),
            ProviderError::Signing(msg) => write!(f, "request signing failed: {msg}"),
            ProviderError::Upstream(msg) => write!(f, "upstream: {msg}"),
        }
    }
}

impl Error for ProviderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProviderError::Template(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TemplateError> for ProviderError {
    fn from(err: TemplateError) -> Self {
        ProviderError::Template(err)
    }
}
