use url::Url;

use crate::error::{ChatError, ChatResult};

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// `https://host/` and `https://host/api` both become `https://host/api`.
pub fn base_api(base_url: &str) -> String {
    let trimmed = normalize_url(base_url);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.ends_with("/api") {
        trimmed.to_string()
    } else {
        format!("{}/api", trimmed)
    }
}

/// Realtime endpoint for a REST base url when none is configured explicitly.
pub fn websocket_url(base_url: &str) -> ChatResult<Url> {
    let mut url = Url::parse(&normalize_url(base_url))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(ChatError::Config(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot derive websocket url from {base_url}")))?;
    let path = format!("{}/realtime", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_api_is_idempotent() {
        assert_eq!(base_api("example.com"), "https://example.com/api");
        assert_eq!(base_api("https://example.com/api/"), "https://example.com/api");
    }

    #[test]
    fn derives_websocket_url() {
        let url = websocket_url("http://localhost:8080").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/realtime");
        let url = websocket_url("chat.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/realtime");
    }
}
