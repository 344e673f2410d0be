//! Host header -> preview site resolution.
//!
//! Pure logic (no Pingora types) so it is easy to test.

/// Strip an optional `:port` (IPv6 literals keep their brackets) and a
/// trailing root dot, and lowercase the result.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// The site a request addresses, if its host is `<label>.<preview_domain>`.
///
/// Hosts outside the preview domain, nested subdomains and reserved labels
/// return `None` and fall through to the API.
pub fn resolve_site(host: &str, preview_domain: &str, reserved: &[String]) -> Option<String> {
    let host = normalize_host(host);
    let domain = preview_domain.trim_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return None;
    }

    let label = host.strip_suffix(&domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    if reserved.iter().any(|r| r.eq_ignore_ascii_case(label)) {
        return None;
    }
    Some(label.to_string())
}
