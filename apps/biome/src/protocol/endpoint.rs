use thiserror::Error;
use url::Url;

/// Path the world engine serves its streaming socket on.
pub const WS_PATH: &str = "/ws";
const DEFAULT_SCHEME: &str = "ws";
const SECURE_SCHEME: &str = "wss";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("invalid_url: endpoint is empty")]
    Empty,
    #[error("invalid_url: unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid_url: '{0}' is not a host[:port] or ws:// URL")]
    Malformed(String),
}

impl EndpointError {
    /// Stable code shown next to the endpoint field.
    pub fn code(&self) -> &'static str {
        "invalid_url"
    }
}

/// Checks what a user typed into the endpoint field.
///
/// Accepts a bare `host[:port]` or a `ws`/`wss`/`http`/`https` URL with an
/// optional path. Returns the trimmed input on success.
pub fn validate_endpoint(input: &str) -> Result<String, EndpointError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(EndpointError::Empty);
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(EndpointError::Malformed(trimmed.to_string()));
    }

    match trimmed.split_once("://") {
        Some((scheme, _)) => {
            let scheme = scheme.to_ascii_lowercase();
            if !matches!(scheme.as_str(), "ws" | "wss" | "http" | "https") {
                return Err(EndpointError::UnsupportedScheme(scheme));
            }
            let parsed =
                Url::parse(trimmed).map_err(|_| EndpointError::Malformed(trimmed.to_string()))?;
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err(EndpointError::Malformed(trimmed.to_string()));
            }
        }
        None => {
            let parsed = Url::parse(&format!("{DEFAULT_SCHEME}://{trimmed}"))
                .map_err(|_| EndpointError::Malformed(trimmed.to_string()))?;
            let bare_host_port = parsed.host_str().is_some_and(|host| !host.is_empty())
                && parsed.username().is_empty()
                && parsed.password().is_none()
                && matches!(parsed.path(), "" | "/")
                && parsed.query().is_none()
                && parsed.fragment().is_none();
            if !bare_host_port {
                return Err(EndpointError::Malformed(trimmed.to_string()));
            }
        }
    }

    Ok(trimmed.to_string())
}

/// Turns an endpoint into the socket URL, defaulting bare hosts to `ws://`.
pub fn normalize_endpoint(input: &str) -> String {
    normalize_endpoint_with(input, false)
}

/// Turns an endpoint into the socket URL.
///
/// Bare `host[:port]` gets `ws://` (or `wss://` when `secure`) plus `/ws`.
/// Schemed input keeps its scheme (`http`/`https` map to `ws`/`wss`) and gets
/// `/ws` appended unless the path already ends with it. Normalizing an
/// already-normalized URL returns it unchanged.
pub fn normalize_endpoint_with(input: &str, secure: bool) -> String {
    let trimmed = input.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = match scheme.to_ascii_lowercase().as_str() {
                "http" => DEFAULT_SCHEME.to_string(),
                "https" => SECURE_SCHEME.to_string(),
                other => other.to_string(),
            };
            (scheme, rest)
        }
        None => {
            let scheme = if secure { SECURE_SCHEME } else { DEFAULT_SCHEME };
            (scheme.to_string(), trimmed)
        }
    };

    let rest = rest.trim_end_matches('/');
    if rest.ends_with(WS_PATH) {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}{WS_PATH}")
    }
}
