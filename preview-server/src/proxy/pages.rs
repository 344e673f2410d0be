//! Minimal HTML pages served to browsers on the preview path

/// Escape text for inclusion in HTML element content or attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, heading: &str, detail: &str, refresh_secs: Option<u32>) -> String {
    let refresh = refresh_secs
        .map(|secs| format!("<meta http-equiv=\"refresh\" content=\"{secs}\">\n"))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n{refresh}<title>{title}</title>\n\
<style>body{{font-family:system-ui,sans-serif;display:flex;align-items:center;justify-content:center;\
min-height:100vh;margin:0;background:#f8fafc;color:#0f172a}}main{{text-align:center}}\
p{{color:#64748b}}</style>\n</head>\n<body>\n<main>\n<h1>{heading}</h1>\n<p>{detail}</p>\n</main>\n</body>\n</html>\n"
    )
}

/// 503 page for sites without a running dev server
pub fn not_ready(site_id: &str) -> String {
    let site = escape_html(site_id);
    page(
        "Preview not ready",
        "Preview not ready",
        &format!("The preview for <code>{site}</code> is not running yet. This page refreshes automatically."),
        Some(3),
    )
}

/// 502 page for failed forwarding
pub fn bad_gateway(site_id: &str) -> String {
    let site = escape_html(site_id);
    page(
        "Preview unavailable",
        "Preview unavailable",
        &format!("The dev server for <code>{site}</code> did not answer."),
        None,
    )
}
