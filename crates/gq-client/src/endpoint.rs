//! Backend location shared by the REST client and the push channel

use parking_lot::RwLock;
use url::Url;

use gq_core::TransportError;

/// Header carrying the optional API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Path of the progress websocket, relative to the base URL
pub const PUSH_PATH: &str = "ws/progress";

/// Where the backend lives, changeable at runtime
pub struct Endpoint {
    base: RwLock<String>,
    api_key: Option<String>,
}

impl Endpoint {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, TransportError> {
        Ok(Self {
            base: RwLock::new(normalize_base_url(base_url)?),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    /// Current base URL, without a trailing slash
    pub fn base_url(&self) -> String {
        self.base.read().clone()
    }

    /// Point at a different backend
    ///
    /// Returns whether the base actually changed.
    pub fn set_base_url(&self, raw: &str) -> Result<bool, TransportError> {
        let normalized = normalize_base_url(raw)?;
        let mut base = self.base.write();
        if *base == normalized {
            return Ok(false);
        }
        *base = normalized;
        Ok(true)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Absolute URL for a REST resource below the base
    ///
    /// Each segment is percent-encoded as exactly one path segment, so an
    /// id containing `/`, `?` or `#` cannot address another resource.
    pub fn rest_url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(TransportError::InvalidId((*bad).to_string()));
        }

        let base = self.base.read();
        let mut url = Url::parse(&base).map_err(|e| TransportError::InvalidUrl {
            url: base.clone(),
            reason: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl {
                url: base.clone(),
                reason: "cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// URL of the push channel for the current base
    pub fn push_url(&self) -> Result<Url, TransportError> {
        push_url_for(&self.base.read())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("base", &*self.base.read())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validate a base URL and strip trailing slashes
pub fn normalize_base_url(raw: &str) -> Result<String, TransportError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty".to_string()));
    }
    let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Derive the push channel URL: `{base}/ws/progress`, http -> ws, https -> wss
pub fn push_url_for(base: &str) -> Result<Url, TransportError> {
    let base = normalize_base_url(base)?;
    let (scheme, rest) = match base.split_once("://") {
        Some(("https", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", base.as_str()),
    };
    let raw = format!("{}://{}/{}", scheme, rest, PUSH_PATH);
    Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })
}
