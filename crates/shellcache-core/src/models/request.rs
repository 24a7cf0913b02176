use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::{Origin, Url};

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(m) => m.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Ok(match upper.as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            _ => Method::Other(upper),
        })
    }
}

/// Whether the request is a top-level document load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestMode {
    Navigate,
    #[default]
    Other,
}

/// How the fetch interceptor handles a request. Derived per request, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Non-GET or cross-origin: passed through, never touches the cache.
    Ignored,
    /// Same-origin GET top-level document load.
    Navigation,
    /// Every other same-origin GET.
    Asset,
}

/// An outgoing request issued by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
}

impl Request {
    pub fn new(url: Url, method: Method, mode: RequestMode) -> Self {
        Self { url, method, mode }
    }

    /// A subresource GET.
    pub fn get(url: Url) -> Self {
        Self::new(url, Method::Get, RequestMode::Other)
    }

    /// A top-level document GET.
    pub fn navigate(url: Url) -> Self {
        Self::new(url, Method::Get, RequestMode::Navigate)
    }

    /// Classify against the worker's own origin.
    ///
    /// Method is checked first, then origin, then mode, so a cross-origin
    /// navigation is still ignored.
    pub fn classify(&self, origin: &Origin) -> RequestClass {
        if self.method != Method::Get {
            return RequestClass::Ignored;
        }
        if &self.url.origin() != origin {
            return RequestClass::Ignored;
        }
        match self.mode {
            RequestMode::Navigate => RequestClass::Navigation,
            RequestMode::Other => RequestClass::Asset,
        }
    }

    /// Cache key for this request: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}
