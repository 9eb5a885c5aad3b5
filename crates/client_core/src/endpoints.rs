use shared::domain::DeviceId;
use url::Url;

use crate::error::SessionError;

/// Resolves the presence and websocket routes of one chat server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    http_base: Url,
    ws_base: Url,
}

impl Endpoints {
    pub fn new(server_url: &str) -> Result<Self, SessionError> {
        let http_base = Url::parse(server_url.trim())
            .map_err(|err| SessionError::Endpoint(format!("{server_url}: {err}")))?;
        let ws_scheme = match http_base.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(SessionError::Endpoint(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        let mut ws_base = http_base.clone();
        ws_base
            .set_scheme(ws_scheme)
            .map_err(|_| SessionError::Endpoint(format!("cannot derive websocket url from {server_url}")))?;
        Ok(Self { http_base, ws_base })
    }

    pub fn server_url(&self) -> &Url {
        &self.http_base
    }

    pub fn presence(&self) -> Result<Url, SessionError> {
        with_segments(&self.http_base, &["online-users"])
    }

    pub fn broadcast(&self, device_id: &DeviceId) -> Result<Url, SessionError> {
        let mut url = with_segments(&self.ws_base, &["ws", "public"])?;
        url.query_pairs_mut()
            .append_pair("device_id", device_id.as_str());
        Ok(url)
    }

    /// `peer` is percent-encoded as a single path segment.
    pub fn private(&self, peer: &DeviceId, from: &DeviceId) -> Result<Url, SessionError> {
        let mut url = with_segments(&self.ws_base, &["ws", "private", peer.as_str()])?;
        url.query_pairs_mut().append_pair("from", from.as_str());
        Ok(url)
    }
}

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, SessionError> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| SessionError::Endpoint(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
