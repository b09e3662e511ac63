//! Candidate endpoint list for the event stream
//!
//! Order: explicit override, primary address, same-origin proxy, same host on
//! the fallback port. Duplicates are dropped keeping the first occurrence.

use super::StreamError;
use crate::types::EventFilter;
use nonempty::NonEmpty;
use tracing::warn;
use url::Url;

/// Where the event stream may be reached
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub override_url: Option<String>,
    pub primary_url: Option<String>,
    /// Origin of a reverse proxy that forwards `/ws` to the stream
    pub proxy_origin: Option<String>,
    /// Port tried on the primary's host when everything else fails
    pub fallback_port: Option<u16>,
}

/// Parse `raw` and map `http`/`https` onto `ws`/`wss`
fn parse_stream_url(raw: &str) -> Option<Url> {
    let mut url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        Err(e) => {
            warn!(url = raw, error = %e, "Skipping unparseable stream endpoint");
            return None;
        }
    };
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        // Both schemes are special, so the switch cannot fail
        let _ = url.set_scheme(scheme);
    }
    Some(url)
}

/// Append `/`-separated `path` to the URL path, keeping query and userinfo
fn with_path(mut url: Url, path: &str) -> Option<Url> {
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(path.split('/').filter(|s| !s.is_empty()));
    Some(url)
}

/// Same scheme, userinfo and host as `anchor`, on `port`, with an empty path
fn on_port(anchor: &Url, port: u16) -> Option<Url> {
    let mut url = anchor.clone();
    url.set_port(Some(port)).ok()?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Some(url)
}

impl EndpointConfig {
    /// Base stream URLs in try order
    pub fn candidates(&self) -> Result<NonEmpty<Url>, StreamError> {
        let override_url = self.override_url.as_deref().and_then(parse_stream_url);
        let primary = self.primary_url.as_deref().and_then(parse_stream_url);
        let proxy = self.proxy_origin.as_deref().and_then(parse_stream_url);

        let fallback = self.fallback_port.and_then(|port| {
            primary
                .as_ref()
                .or(proxy.as_ref())
                .and_then(|anchor| on_port(anchor, port))
        });
        let proxied = proxy.and_then(|origin| with_path(origin, "ws"));

        let mut deduped: Vec<Url> = Vec::with_capacity(4);
        for url in [override_url, primary, proxied, fallback].into_iter().flatten() {
            if !deduped.contains(&url) {
                deduped.push(url);
            }
        }

        NonEmpty::from_vec(deduped).ok_or(StreamError::NoEndpoints)
    }

    /// Full subscription URLs for `filter`, in try order
    pub fn urls_for(&self, filter: &EventFilter) -> Result<NonEmpty<String>, StreamError> {
        let path = filter.path();
        let urls: Vec<String> = self
            .candidates()?
            .into_iter()
            .filter_map(|base| with_path(base, &path))
            .map(String::from)
            .collect();
        NonEmpty::from_vec(urls).ok_or(StreamError::NoEndpoints)
    }
}
