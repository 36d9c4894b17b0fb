use url::Url;

/// Query parameters dropped in addition to every `utm_*` key.
const TRACKING_PARAMS: [&str; 4] = ["fbclid", "gclid", "mc_cid", "mc_eid"];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Normalize a search result URL so the same article is resolved once.
///
/// - Strips tracking query parameters (utm_*, fbclid, gclid, mc_*)
/// - Drops the fragment
/// - Lowercases the hostname
/// - Converts protocol-relative URLs to https
///
/// Paths are left alone, including trailing slashes. Returns the original
/// string if the URL cannot be parsed.
pub fn normalize_url(url: &str) -> String {
    let url_to_parse = if url.starts_with("//") {
        format!("https:{}", url)
    } else {
        url.to_string()
    };

    let mut parsed = match Url::parse(&url_to_parse) {
        Ok(u) => u,
        Err(_) => return url.to_string(),
    };

    if let Some(host) = parsed.host_str() {
        let lowercased = host.to_lowercase();
        if parsed.set_host(Some(&lowercased)).is_err() {
            return url.to_string();
        }
    }

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, value)| !value.is_empty() && !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    parsed.set_query(None);
    if !kept.is_empty() {
        parsed.query_pairs_mut().extend_pairs(kept);
    }
    parsed.set_fragment(None);

    parsed.to_string()
}

/// Host part of a URL, lowercased.
pub fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
