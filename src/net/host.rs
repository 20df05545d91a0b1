//! Host string normalization
//!
//! Peers are keyed by host, so two spellings of the same address must
//! compare equal before anything is stored or looked up: schemes,
//! userinfo, paths, and default ports are stripped, hostnames are
//! lowercased, and IPv6 literals are bracketed only when a port remains.

/// Normalize a host reference to canonical `hostname[:port]` form.
/// Returns `None` when no usable host can be extracted.
pub fn normalize_host(input: &str) -> Option<String> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    // A bare IPv6 literal has at least two colons and no scheme or path.
    if !s.contains("://")
        && !s.contains('/')
        && s.matches(':').count() >= 2
        && !s.starts_with('[')
        && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    {
        return Some(s.to_ascii_lowercase());
    }

    let (scheme, rest) = match s.find("://") {
        Some(idx) => (s[..idx].to_ascii_lowercase(), &s[idx + 3..]),
        None => ("https".to_string(), s),
    };

    // authority ends at the first path, query, or fragment delimiter
    let authority = rest
        .find(['/', '?', '#'])
        .map_or(rest, |idx| &rest[..idx]);
    let authority = authority
        .rfind('@')
        .map_or(authority, |idx| &authority[idx + 1..]);
    if authority.is_empty() {
        return None;
    }

    let (hostname, port) = if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let port = match &stripped[end + 1..] {
            "" => None,
            p => Some(p.strip_prefix(':')?),
        };
        (host, port)
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        if host.contains(':') {
            // unbracketed IPv6 with no port
            (authority, None)
        } else {
            (host, Some(port))
        }
    } else {
        (authority, None)
    };

    if hostname.is_empty() {
        return None;
    }
    let hostname = hostname.to_ascii_lowercase();

    let port = match port {
        None | Some("") => None,
        Some(p) => {
            let n: u16 = p.parse().ok()?;
            let default = match scheme.as_str() {
                "http" => 80,
                "https" => 443,
                _ => 0,
            };
            if n == default {
                None
            } else {
                Some(n)
            }
        }
    };

    let is_ipv6 = hostname.contains(':');
    Some(match (is_ipv6, port) {
        (true, Some(p)) => format!("[{hostname}]:{p}"),
        (true, None) => hostname,
        (false, Some(p)) => format!("{hostname}:{p}"),
        (false, None) => hostname,
    })
}
