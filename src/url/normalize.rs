use crate::UrlError;
use url::Url;

/// Bytes that pass through a path or query component unescaped
const SAFE_BYTES: &[u8] = b"-._~/+&=[]";

/// Canonicalizes an absolute URL
///
/// The canonical form is what the queue store keys documents by, so two
/// spellings of the same resource must collapse to one string.
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Only `http` and `https` are accepted
/// 3. Host is lowercased and default ports are dropped (done by `url`)
/// 4. Dot segments are resolved (done by `url`)
/// 5. Fragment is removed
/// 6. Path and query are re-escaped with [`normalize_component`]
/// 7. An empty query (`?` with nothing after it) is removed
///
/// Trailing slashes are significant and are kept: `/a` and `/a/` are
/// different documents that may redirect to each other.
///
/// # Examples
///
/// ```
/// use ampelopsis::url::normalize_url;
///
/// let url = normalize_url("HTTP://Example.COM:80/a/./b/../c#top").unwrap();
/// assert_eq!(url.as_str(), "http://example.com/a/c");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    canonicalize(url)
}

/// Resolves a (possibly relative) link against a base and canonicalizes it
pub fn resolve_link(base: &Url, href: &str) -> Result<Url, UrlError> {
    let url = base
        .join(href.trim())
        .map_err(|e| UrlError::Parse(e.to_string()))?;
    canonicalize(url)
}

fn canonicalize(mut url: Url) -> Result<Url, UrlError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    url.set_fragment(None);

    let path = normalize_component(url.path());
    url.set_path(&path);

    match url.query().map(normalize_component) {
        Some(query) if !query.is_empty() => url.set_query(Some(&query)),
        _ => url.set_query(None),
    }

    Ok(url)
}

/// Re-escapes one URL component
///
/// Existing escapes are kept but their hex digits are uppercased, escapes of
/// unreserved characters are decoded, and every byte outside the unreserved
/// set plus `/+&=[]` is percent-encoded.
///
/// # Examples
///
/// ```
/// use ampelopsis::url::normalize_component;
///
/// assert_eq!(normalize_component("/a%2fb%7Ec"), "/a%2Fb~c");
/// assert_eq!(normalize_component("q=x y"), "q=x%20y");
/// ```
pub fn normalize_component(component: &str) -> String {
    let bytes = component.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if is_unreserved(decoded) {
                    out.push(decoded as char);
                } else {
                    push_escaped(&mut out, decoded);
                }
                i += 3;
                continue;
            }
        }

        if is_unreserved(b) || SAFE_BYTES.contains(&b) {
            out.push(b as char);
        } else {
            push_escaped(&mut out, b);
        }
        i += 1;
    }

    out
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn push_escaped(out: &mut String, b: u8) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out.push('%');
    out.push(HEX[(b >> 4) as usize] as char);
    out.push(HEX[(b & 0x0f) as usize] as char);
}
