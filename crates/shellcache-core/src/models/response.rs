use bytes::Bytes;

/// A fully buffered response.
///
/// The body is consumed by whoever receives the value. Code that both returns
/// a response and persists it calls `duplicate()` first, once.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 200 response with no headers.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, Vec::new(), body)
    }

    /// True for 2xx statuses.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Second, independent copy of this response. `Bytes` shares the buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ok() {
        assert!(Response::ok("x").is_ok());
        assert!(Response::new(204, vec![], "").is_ok());
        assert!(!Response::new(404, vec![], "").is_ok());
        assert!(!Response::new(301, vec![], "").is_ok());
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let resp = Response::new(
            200,
            vec![("Content-Type".to_string(), "text/html".to_string())],
            "<html>",
        );
        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert_eq!(resp.header("etag"), None);
    }

    #[test]
    fn test_duplicate_is_equal() {
        let resp = Response::new(200, vec![("ETag".to_string(), "\"1\"".to_string())], "body");
        assert_eq!(resp.duplicate(), resp);
    }
}
