use std::net::IpAddr;
use url::Url;

/// Extracts the key a URL's host is whitelisted under
///
/// With `match_domain` unset this is the lowercase host name. With it set,
/// sibling hosts share one key: the registrable domain (last two labels),
/// so `www.example.com` and `example.com` are the same host.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use ampelopsis::url::host_key;
///
/// let url = Url::parse("https://www.Example.com/path").unwrap();
/// assert_eq!(host_key(&url, false), Some("www.example.com".to_string()));
/// assert_eq!(host_key(&url, true), Some("example.com".to_string()));
/// ```
pub fn host_key(url: &Url, match_domain: bool) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    if match_domain {
        Some(registrable_domain(&host).to_string())
    } else {
        Some(host)
    }
}

/// Returns the last two labels of a host name; IP addresses are returned whole
pub fn registrable_domain(host: &str) -> &str {
    let trimmed = host.trim_end_matches('.');
    if trimmed.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok() {
        return trimmed;
    }

    let mut dots = trimmed.rmatch_indices('.');
    match (dots.next(), dots.next()) {
        (Some(_), Some((idx, _))) => &trimmed[idx + 1..],
        _ => trimmed,
    }
}
