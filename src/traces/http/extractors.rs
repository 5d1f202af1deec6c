use axum::extract::{ConnectInfo, MatchedPath, OriginalUri};
use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header, request::Parts, HeaderMap, Uri, Version};
use opentelemetry::{trace::Status, KeyValue};
use opentelemetry_semantic_conventions::trace::{
    CLIENT_ADDRESS, CLIENT_PORT, ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE,
    HTTP_ROUTE, NETWORK_PROTOCOL_NAME, NETWORK_PROTOCOL_VERSION, NETWORK_TRANSPORT,
    SERVER_ADDRESS, SERVER_PORT, URL_PATH, URL_QUERY, URL_SCHEME, USER_AGENT_ORIGINAL,
};
use std::net::SocketAddr;

/// Name of the service handling the request, as given to the layer.
pub const HTTP_SERVER_NAME: &str = "http.server_name";
/// Username of the authenticated caller.
pub const ENDUSER_ID: &str = "enduser.id";

/// Uri as received by the server, before any nested router stripped its prefix.
fn original_uri(parts: &Parts) -> &Uri {
    parts
        .extensions
        .get::<OriginalUri>()
        .map_or(&parts.uri, |original| &original.0)
}

/// Route template matched by the router, for example `/user/{id}`.
pub fn matched_route(parts: &Parts) -> Option<&str> {
    parts.extensions.get::<MatchedPath>().map(MatchedPath::as_str)
}

/// The literal request target is used as span name.
/// A request without one (authority-form for example) gets a synthetic name.
pub fn span_name_from_request(parts: &Parts) -> String {
    match original_uri(parts).path_and_query() {
        Some(target) if !target.as_str().is_empty() => target.as_str().to_owned(),
        _ => format!("HTTP {} route not found", parts.method),
    }
}

/// Transport and connection information following the
/// [OTEL specification](https://opentelemetry.io/docs/specs/semconv/http/http-spans/#http-server)
pub fn net_attributes_from_request(transport: &'static str, parts: &Parts) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(NETWORK_TRANSPORT, transport),
        KeyValue::new(NETWORK_PROTOCOL_NAME, "http"),
    ];
    if let Some(version) = get_http_version(parts.version) {
        attributes.push(KeyValue::new(NETWORK_PROTOCOL_VERSION, version));
    }

    let (server_address, server_port) = extract_server_address_and_port(parts);
    if let Some(address) = server_address {
        attributes.push(KeyValue::new(SERVER_ADDRESS, address));
    }
    if let Some(port) = server_port {
        attributes.push(KeyValue::new(SERVER_PORT, i64::from(port)));
    }

    let (client_address, client_port) = extract_client_address_and_port(parts);
    if let Some(address) = client_address {
        attributes.push(KeyValue::new(CLIENT_ADDRESS, address));
    }
    if let Some(port) = client_port {
        attributes.push(KeyValue::new(CLIENT_PORT, i64::from(port)));
    }

    attributes
}

/// Identity of the caller when it authenticated with HTTP basic credentials.
pub fn end_user_attributes_from_request(parts: &Parts) -> Vec<KeyValue> {
    basic_auth_username(&parts.headers)
        .map(|username| vec![KeyValue::new(ENDUSER_ID, username)])
        .unwrap_or_default()
}

/// `http.route` is only set when the router exposed the matched template,
/// an empty `route` leaves it out.
pub fn http_server_attributes_from_request(
    service_name: &str,
    route: &str,
    parts: &Parts,
) -> Vec<KeyValue> {
    let uri = original_uri(parts);
    let mut attributes = vec![
        KeyValue::new(HTTP_SERVER_NAME, service_name.to_owned()),
        KeyValue::new(HTTP_REQUEST_METHOD, parts.method.as_str().to_owned()),
        KeyValue::new(URL_PATH, uri.path().to_owned()),
        KeyValue::new(URL_SCHEME, uri.scheme_str().unwrap_or("http").to_owned()),
    ];
    if !route.is_empty() {
        attributes.push(KeyValue::new(HTTP_ROUTE, route.to_owned()));
    }
    if let Some(query) = uri.query() {
        attributes.push(KeyValue::new(URL_QUERY, query.to_owned()));
    }
    if let Some(user_agent) = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        attributes.push(KeyValue::new(USER_AGENT_ORIGINAL, user_agent.to_owned()));
    }
    attributes
}

pub fn http_attributes_from_status_code(code: u16) -> Vec<KeyValue> {
    let mut attributes = vec![KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(code))];
    if (500..600).contains(&code) {
        attributes.push(KeyValue::new(ERROR_TYPE, code.to_string()));
    }
    attributes
}

/// Span status of a server span: only 5xx are errors, 4xx are the client's fault.
///
/// Unlike client spans, a 4xx response leaves the server span status unset.
pub fn span_status_from_status_code(code: u16) -> Status {
    match code {
        100..=499 => Status::Unset,
        500..=599 => Status::error(format!("HTTP status code: {code}")),
        _ => Status::error(format!("Invalid HTTP status code {code}")),
    }
}

fn basic_auth_username(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(credentials.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    match decoded.split_once(':') {
        Some((username, _password)) if !username.is_empty() => Some(username.to_owned()),
        _ => None,
    }
}

/// Extract the server host and port following the [OTEL specification](https://opentelemetry.io/docs/specs/semconv/http/http-spans/#setting-serveraddress-and-serverport-attributes)
fn extract_server_address_and_port(parts: &Parts) -> (Option<String>, Option<u16>) {
    let headers = &parts.headers;

    if let Some(host) = headers
        .get(header::FORWARDED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| forwarded_directive(value, "host"))
    {
        return split_host_and_port(host);
    }

    if let Some(host) = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
    {
        return split_host_and_port(host);
    }

    // :authority pseudo header for HTTP2/3 or absolute-form target
    if let Some(authority) = parts.uri.authority() {
        return (Some(authority.host().to_owned()), authority.port_u16());
    }

    if let Some(host) = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    {
        return split_host_and_port(host);
    }

    (None, None)
}

fn extract_client_address_and_port(parts: &Parts) -> (Option<String>, Option<u16>) {
    let headers = &parts.headers;

    if let Some(client) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|client| !client.is_empty())
    {
        return (Some(client.to_owned()), None);
    }

    if let Some(client) = headers
        .get(header::FORWARDED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| forwarded_directive(value, "for"))
    {
        return (split_host_and_port(client).0, None);
    }

    match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => (Some(addr.ip().to_string()), Some(addr.port())),
        None => (None, None),
    }
}

/// First value of `directive` in a `Forwarded` header, only the closest proxy is considered.
fn forwarded_directive<'a>(header_value: &'a str, directive: &str) -> Option<&'a str> {
    let closest_proxy = header_value.split(',').next()?;
    closest_proxy.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        name.eq_ignore_ascii_case(directive)
            .then(|| value.trim().trim_matches('"'))
    })
}

fn split_host_and_port(host: &str) -> (Option<String>, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal, optionally followed by a port
        return match rest.split_once(']') {
            Some((address, port)) => (
                Some(address.to_owned()),
                port.strip_prefix(':').and_then(|p| p.parse().ok()),
            ),
            None => (Some(host.to_owned()), None),
        };
    }
    match host.split_once(':') {
        Some((address, port)) => (Some(address.to_owned()), port.parse().ok()),
        None => (Some(host.to_owned()), None),
    }
}

pub fn get_http_version(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}
