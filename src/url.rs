//! Endpoint parsing for the receiver daemon

use anyhow::{bail, Context, Result};
use url::Url;

use crate::protocol::{DEFAULT_PORT, RECEIVER_PATH};

/// Parse the client's `--url` value.
///
/// Accepts a full `http(s)://` URL (used as-is) or a bare `host[:port]`
/// shorthand, which expands to `http://host:port/receiver`.
pub fn parse_endpoint(raw: &str) -> Result<Url> {
    let s = raw.trim();
    if s.is_empty() {
        bail!("empty server URL");
    }
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = Url::parse(s).with_context(|| format!("invalid server URL: {s}"))?;
        if url.host_str().is_none() {
            bail!("server URL has no host: {s}");
        }
        return Ok(url);
    }
    if s.contains("://") {
        bail!("unsupported scheme in server URL: {s}");
    }

    let (hp, path) = match s.split_once('/') {
        Some((hp, p)) => (hp, format!("/{p}")),
        None => (s, RECEIVER_PATH.to_string()),
    };
    if hp.is_empty() {
        bail!("server URL has no host: {s}");
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (
            h,
            pr.parse::<u16>()
                .with_context(|| format!("invalid port in server URL: {s}"))?,
        ),
        None => (hp, DEFAULT_PORT),
    };
    Url::parse(&format!("http://{host}:{port}{path}"))
        .with_context(|| format!("invalid server URL: {s}"))
}
