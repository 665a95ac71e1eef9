use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Reasons a feed URL is refused.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a feed URL before it is registered or fetched.
///
/// The URL must be absolute http(s) with a host. Unless `allow_private` is
/// set, loopback, `localhost` and private or link-local IP literals are
/// refused so a registry entry cannot point the pipeline at internal hosts.
///
/// # Examples
///
/// ```
/// use tunefeed::util::validate_feed_url;
///
/// assert!(validate_feed_url("https://example.com/album.xml", false).is_ok());
/// assert!(validate_feed_url("http://192.168.1.1/feed", false).is_err());
/// assert!(validate_feed_url("http://127.0.0.1:8080/feed", true).is_ok());
/// assert!(validate_feed_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_feed_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if allow_private {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
