use axum::http::{HeaderMap, HeaderValue};

/// Header carrying the remaining hop count of an event.
pub const TTL_HEADER: &str = "ce-knativebrokerttl";

/// Hop count given to events entering the broker without one.
pub const DEFAULT_TTL: u32 = 255;

/// Sets the hop count of events that lack a usable one.
#[derive(Debug, Clone, Copy)]
pub struct TtlDefaulter {
    default_ttl: u32,
}

impl TtlDefaulter {
    pub fn new(default_ttl: u32) -> Self {
        Self { default_ttl }
    }

    /// Returns the hop count the event carries after defaulting.
    pub fn apply(&self, headers: &mut HeaderMap) -> u32 {
        let current = headers
            .get(TTL_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());
        match current {
            Some(ttl) => ttl,
            None => {
                headers.insert(TTL_HEADER, HeaderValue::from(self.default_ttl));
                self.default_ttl
            }
        }
    }
}

impl Default for TtlDefaulter {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_default_when_absent() {
        let mut headers = HeaderMap::new();
        assert_eq!(TtlDefaulter::default().apply(&mut headers), 255);
        assert_eq!(headers[TTL_HEADER], "255");
    }

    #[test]
    fn keeps_existing_ttl() {
        let mut headers = HeaderMap::new();
        headers.insert(TTL_HEADER, HeaderValue::from_static("3"));
        assert_eq!(TtlDefaulter::new(10).apply(&mut headers), 3);
        assert_eq!(headers[TTL_HEADER], "3");
    }

    #[test]
    fn replaces_unparseable_ttl() {
        let mut headers = HeaderMap::new();
        headers.insert(TTL_HEADER, HeaderValue::from_static("many"));
        assert_eq!(TtlDefaulter::new(10).apply(&mut headers), 10);
        assert_eq!(headers[TTL_HEADER], "10");
    }
}
