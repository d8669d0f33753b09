//! Edge keys: the bootstrap secret handed to an edge agent at enrollment.
//!
//! An edge key is the URL-safe, unpadded base64 encoding of
//! `server_addr|tunnel_port|endpoint_id`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Endpoint identifier as carried in an edge key.
pub type EndpointId = i64;

const SEPARATOR: char = '|';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EdgeKeyError {
    #[error("Invalid edge key format: {0}")]
    InvalidKeyFormat(&'static str),
}

/// Everything an agent needs to reach its tunnel server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeKey {
    /// Host (name or address) the agent dials.
    pub server_addr: String,
    pub tunnel_port: u16,
    pub endpoint_id: EndpointId,
}

impl EdgeKey {
    pub fn new(server_addr: impl Into<String>, tunnel_port: u16, endpoint_id: EndpointId) -> Self {
        Self {
            server_addr: server_addr.into(),
            tunnel_port,
            endpoint_id,
        }
    }

    /// `host:port` of the tunnel server.
    pub fn tunnel_addr(&self) -> String {
        format!("{}:{}", self.server_addr, self.tunnel_port)
    }

    pub fn encode(&self) -> Result<String, EdgeKeyError> {
        if self.server_addr.is_empty() {
            return Err(EdgeKeyError::InvalidKeyFormat("empty server address"));
        }
        if self.server_addr.contains(SEPARATOR) {
            return Err(EdgeKeyError::InvalidKeyFormat("server address contains '|'"));
        }
        if self.tunnel_port == 0 {
            return Err(EdgeKeyError::InvalidKeyFormat("tunnel port is zero"));
        }

        let raw = format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.server_addr, self.tunnel_port, self.endpoint_id
        );
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Parse an edge key; only the exact form [`EdgeKey::encode`] produces
    /// is accepted.
    pub fn decode(key: &str) -> Result<Self, EdgeKeyError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(key)
            .map_err(|_| EdgeKeyError::InvalidKeyFormat("not base64"))?;
        let raw =
            String::from_utf8(bytes).map_err(|_| EdgeKeyError::InvalidKeyFormat("not UTF-8"))?;

        let mut parts = raw.split(SEPARATOR);
        let (Some(server_addr), Some(port), Some(endpoint), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(EdgeKeyError::InvalidKeyFormat("expected three fields"));
        };

        if server_addr.is_empty() {
            return Err(EdgeKeyError::InvalidKeyFormat("empty server address"));
        }
        let tunnel_port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or(EdgeKeyError::InvalidKeyFormat("invalid tunnel port"))?;
        let endpoint_id = endpoint
            .parse::<EndpointId>()
            .map_err(|_| EdgeKeyError::InvalidKeyFormat("invalid endpoint id"))?;

        let decoded = Self {
            server_addr: server_addr.to_string(),
            tunnel_port,
            endpoint_id,
        };
        if decoded.encode()? != key {
            return Err(EdgeKeyError::InvalidKeyFormat("not in canonical form"));
        }
        Ok(decoded)
    }
}
