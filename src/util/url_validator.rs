use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors from validating the API base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only https, or http for localhost)")]
    UnsupportedScheme(String),
    /// Plain http to anything other than a loopback host.
    #[error("Insecure http not allowed for {0}; use https")]
    Insecure(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("URL must not carry a query or fragment")]
    HasQuery,
}

/// Validates the feed API base URL.
///
/// `https` is required, except for `http://localhost`, `127.0.0.1` or
/// `[::1]` during local development.
///
/// ```
/// use feedsync::util::validate_base_url;
///
/// assert!(validate_base_url("https://api.example.com").is_ok());
/// assert!(validate_base_url("http://localhost:8080").is_ok());
/// assert!(validate_base_url("http://api.example.com").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if url.query().is_some() || url.fragment().is_some() {
        return Err(UrlValidationError::HasQuery);
    }

    match url.scheme() {
        "https" => {}
        "http" if is_loopback_host(host) => {}
        "http" => return Err(UrlValidationError::Insecure(host.to_owned())),
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    Ok(url)
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    // IPv6 hosts come bracketed
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
