//! Engine address helpers
//!
//! Node addresses are kept the way callers registered them, e.g.
//! `http://10.0.0.1:2375`, `tcp://10.0.0.1:2376` or a bare `10.0.0.1:2375`.

use reqwest::Url;

/// Parse an engine address, assuming `http://` when no scheme is given
fn parse(addr: &str) -> Option<Url> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("http://{}", trimmed)).ok()
    }
}

/// Extract the host part of an address
///
/// Returns the input unchanged when it cannot be parsed as a URL, so plain
/// hostnames still compare equal to themselves.
pub fn url_to_host(addr: &str) -> String {
    match parse(addr).and_then(|u| u.host_str().map(|h| h.to_string())) {
        Some(host) => host,
        None => addr.trim().to_string(),
    }
}

/// Base URL used to talk to the engine at `addr`
///
/// `tcp://` is rewritten to `http://` (or `https://` when TLS is enabled).
pub fn engine_base_url(addr: &str, tls: bool) -> Option<String> {
    let url = parse(addr)?;
    let host = url.host_str()?;
    let scheme = if tls { "https" } else { "http" };
    let base = match url.port() {
        Some(port) => format!("{}://{}:{}", scheme, host, port),
        None => format!("{}://{}", scheme, host),
    };
    Some(base)
}
