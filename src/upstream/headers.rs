//! Header sanitizing between the client and upstream legs of a relay.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};

/// Hop-by-hop headers that must never cross a proxy boundary.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection: foo, bar` are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Prepare upstream response headers for re-sending to the client.
///
/// `default_content_type` is applied only when upstream sent none.
pub fn sanitize_for_client(
    upstream: &HeaderMap,
    default_content_type: Option<&'static str>,
) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(content_type) = default_content_type
        && !headers.contains_key(header::CONTENT_TYPE)
    {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
    }

    headers
}

/// Prepare client request headers for forwarding upstream.
///
/// `Host` is always dropped so the transport sets it for the target. With
/// `strip_range` the client's `Range` (and `If-Range`) is removed as well, for
/// fetches that must retrieve the whole object.
pub fn sanitize_for_upstream(client: &HeaderMap, strip_range: bool) -> HeaderMap {
    let mut headers = client.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    // reqwest computes these for the outgoing request
    headers.remove(header::CONTENT_LENGTH);

    if strip_range {
        headers.remove(header::RANGE);
        headers.remove(header::IF_RANGE);
    }

    headers
}
