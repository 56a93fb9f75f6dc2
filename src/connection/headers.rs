//! Request-header assembly: field classification, canonical casing,
//! and the pending-request state built up across HEADERS and
//! CONTINUATION frames.

use std::collections::HashMap;

/// A case-preserving multimap of header fields.
///
/// Keys are stored in canonical form (`Foo-Bar`), matching how the
/// handler looks them up; names are lowercased again when written to
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: HashMap<String, Vec<String>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for the canonicalized `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&canonical_key(key))
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for the canonicalized `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&canonical_key(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append a value under the canonicalized `key`.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(canonical_key(key))
            .or_default()
            .push(value.into());
    }

    /// Append a value under a key that is already canonical.
    pub(crate) fn add_canonical(&mut self, key: String, value: String) {
        self.entries.entry(key).or_default().push(value);
    }

    /// Replace all values under the canonicalized `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(canonical_key(key), vec![value.into()]);
    }

    /// Remove the canonicalized `key`.
    pub fn del(&mut self, key: &str) {
        self.entries.remove(&canonical_key(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }

    pub(crate) fn get_all_mut(&mut self, key: &str) -> Option<&mut Vec<String>> {
        self.entries.get_mut(&canonical_key(key))
    }
}

/// Canonicalize a header key: first letter and every letter after a
/// hyphen uppercased, the rest lowercased. Keys containing bytes that
/// are not legal header-name characters are returned unchanged.
pub fn canonical_key(key: &str) -> String {
    if !valid_header_name(key.as_bytes()) {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for c in key.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Check a wire header name: non-empty, token characters only, and no
/// uppercase (HTTP/2 requires lowercase names on the wire).
pub(crate) fn valid_wire_header_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name
            .iter()
            .all(|&b| is_token_byte(b) && !b.is_ascii_uppercase())
}

fn valid_header_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|&b| is_token_byte(b))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Canonicalization cache for decoded request headers, keyed by the
/// lowercase wire name. Sized by whatever the client actually sends.
#[derive(Debug, Default)]
pub(crate) struct HeaderCanonicalizer {
    cache: HashMap<String, String>,
}

impl HeaderCanonicalizer {
    pub fn canonical(&mut self, name: &str) -> String {
        if let Some(known) = common_canonical(name) {
            return known.to_string();
        }
        if let Some(hit) = self.cache.get(name) {
            return hit.clone();
        }
        let canonical = canonical_key(name);
        self.cache.insert(name.to_string(), canonical.clone());
        canonical
    }
}

fn common_canonical(name: &str) -> Option<&'static str> {
    Some(match name {
        "accept" => "Accept",
        "accept-charset" => "Accept-Charset",
        "accept-encoding" => "Accept-Encoding",
        "accept-language" => "Accept-Language",
        "authorization" => "Authorization",
        "cache-control" => "Cache-Control",
        "content-encoding" => "Content-Encoding",
        "content-length" => "Content-Length",
        "content-type" => "Content-Type",
        "cookie" => "Cookie",
        "expect" => "Expect",
        "host" => "Host",
        "if-match" => "If-Match",
        "if-modified-since" => "If-Modified-Since",
        "if-none-match" => "If-None-Match",
        "referer" => "Referer",
        "user-agent" => "User-Agent",
        _ => return None,
    })
}

/// The request being assembled from a HEADERS frame and zero or more
/// CONTINUATION frames. Lives on the serve loop while a header block
/// is in progress.
#[derive(Debug)]
pub(crate) struct RequestParam {
    /// Stream the header block belongs to.
    pub stream_id: u32,
    pub header: HeaderMap,
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub authority: String,
    /// A non-pseudo header has been seen.
    pub saw_regular_header: bool,
    /// The request is malformed and will be rejected at END_HEADERS.
    pub invalid_header: bool,
}

impl RequestParam {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            header: HeaderMap::new(),
            method: String::new(),
            path: String::new(),
            scheme: String::new(),
            authority: String::new(),
            saw_regular_header: false,
            invalid_header: false,
        }
    }

    /// Classify one decoded header field.
    pub fn on_header_field(&mut self, name: &[u8], value: &[u8], canon: &mut HeaderCanonicalizer) {
        let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) else {
            self.invalid_header = true;
            return;
        };

        if let Some(pseudo) = name.strip_prefix(':') {
            // Pseudo-headers must precede every regular header, appear
            // at most once, and come from the known request set.
            if self.saw_regular_header {
                tracing::debug!(name, "pseudo-header after regular header");
                self.invalid_header = true;
                return;
            }
            let dst = match pseudo {
                "method" => &mut self.method,
                "path" => &mut self.path,
                "scheme" => &mut self.scheme,
                "authority" => &mut self.authority,
                _ => {
                    tracing::debug!(name, "unknown pseudo-header");
                    self.invalid_header = true;
                    return;
                }
            };
            if !dst.is_empty() {
                tracing::debug!(name, "duplicate pseudo-header");
                self.invalid_header = true;
                return;
            }
            *dst = value.to_string();
            return;
        }

        if !valid_wire_header_name(name.as_bytes()) {
            self.invalid_header = true;
            return;
        }

        self.saw_regular_header = true;
        if name == "cookie" {
            // Crumbs split for HPACK compression are glued back
            // together (draft-14 section 8.1.2.5).
            match self.header.get_all_mut("Cookie") {
                Some(values) if values.len() == 1 => {
                    values[0].push_str("; ");
                    values[0].push_str(value);
                }
                _ => self.header.add("Cookie", value),
            }
            return;
        }

        let key = canon.canonical(name);
        self.header.add_canonical(key, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(param: &mut RequestParam, fields: &[(&str, &str)]) {
        let mut canon = HeaderCanonicalizer::default();
        for (name, value) in fields {
            param.on_header_field(name.as_bytes(), value.as_bytes(), &mut canon);
        }
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("foo-bar"), "Foo-Bar");
        assert_eq!(canonical_key("CONTENT-length"), "Content-Length");
        assert_eq!(canonical_key("x"), "X");
        // Invalid characters leave the key untouched.
        assert_eq!(canonical_key("weird key"), "weird key");
    }

    #[test]
    fn test_header_map_lookup_is_canonical() {
        let mut map = HeaderMap::new();
        map.add("foo-bar", "a");
        map.add("Foo-Bar", "b");
        assert_eq!(map.get("FOO-BAR"), Some("a"));
        assert_eq!(map.get_all("foo-bar"), &["a", "b"]);
        map.set("foo-bar", "c");
        assert_eq!(map.get_all("foo-bar"), &["c"]);
        map.del("foo-bar");
        assert!(map.get("foo-bar").is_none());
    }

    #[test]
    fn test_request_pseudo_headers() {
        let mut param = RequestParam::new(1);
        feed(
            &mut param,
            &[
                (":method", "GET"),
                (":path", "/"),
                (":scheme", "https"),
                (":authority", "example.com"),
                ("foo-bar", "some-value"),
            ],
        );
        assert!(!param.invalid_header);
        assert_eq!(param.method, "GET");
        assert_eq!(param.path, "/");
        assert_eq!(param.scheme, "https");
        assert_eq!(param.authority, "example.com");
        assert_eq!(param.header.get_all("Foo-Bar"), &["some-value"]);
    }

    #[test]
    fn test_pseudo_after_regular_is_invalid() {
        let mut param = RequestParam::new(1);
        feed(&mut param, &[("accept", "*/*"), (":method", "GET")]);
        assert!(param.invalid_header);
    }

    #[test]
    fn test_duplicate_pseudo_is_invalid() {
        let mut param = RequestParam::new(1);
        feed(&mut param, &[(":method", "GET"), (":method", "POST")]);
        assert!(param.invalid_header);
    }

    #[test]
    fn test_unknown_pseudo_is_invalid() {
        let mut param = RequestParam::new(1);
        feed(&mut param, &[(":proto", "h2")]);
        assert!(param.invalid_header);
    }

    #[test]
    fn test_uppercase_wire_name_is_invalid() {
        let mut param = RequestParam::new(1);
        feed(&mut param, &[("Accept", "*/*")]);
        assert!(param.invalid_header);
    }

    #[test]
    fn test_cookie_crumbs_are_joined() {
        let mut param = RequestParam::new(1);
        feed(
            &mut param,
            &[("cookie", "a=1"), ("cookie", "b=2"), ("cookie", "c=3")],
        );
        assert_eq!(param.header.get_all("Cookie"), &["a=1; b=2; c=3"]);
    }

    #[test]
    fn test_common_headers_canonicalized() {
        let mut param = RequestParam::new(1);
        feed(
            &mut param,
            &[("user-agent", "test"), ("x-custom-thing", "v")],
        );
        assert_eq!(param.header.get("User-Agent"), Some("test"));
        assert_eq!(param.header.get("X-Custom-Thing"), Some("v"));
    }

    #[test]
    fn test_canonicalizer_caches() {
        let mut canon = HeaderCanonicalizer::default();
        assert_eq!(canon.canonical("x-request-id"), "X-Request-Id");
        assert_eq!(canon.canonical("x-request-id"), "X-Request-Id");
        assert_eq!(canon.cache.len(), 1);
    }
}
