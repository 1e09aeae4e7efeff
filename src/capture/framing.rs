// src/capture/framing.rs
//! Minimal HTTP/1.x request framing
//!
//! Only what the engine needs: index method/host/path of captured requests,
//! re-validate edited requests before they replace the original, and build
//! the synthetic response sent for dropped exchanges. This is not a general
//! HTTP parser.

use crate::utils::errors::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Indexed view of a request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Host from the `Host` header, or the authority of an absolute-form target
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Path (with query) of the target
    pub path: String,
}

/// A request split into its head lines and body
struct Framed<'a> {
    request_line: &'a str,
    header_lines: Vec<&'a str>,
    headers: Vec<(&'a str, &'a str)>,
    body: &'a [u8],
}

/// Parse the head of a captured request for indexing
pub fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let framed = split(raw).map_err(EngineError::InvalidRequest)?;
    head_of(&framed).map_err(EngineError::InvalidRequest)
}

/// Re-validate edited request bytes for a flow captured for `original_host`.
///
/// Returns the bytes to send upstream: identical to the input except that
/// line endings in the head are normalized to CRLF and `Content-Length` is
/// rewritten (or added) when it no longer matches the body.
pub fn revalidate(edited: &[u8], original_host: &str, original_port: Option<u16>) -> Result<Bytes> {
    let framed = split(edited).map_err(EngineError::MalformedEditedRequest)?;
    let head = head_of(&framed).map_err(EngineError::MalformedEditedRequest)?;

    let host = head.host.as_deref().ok_or_else(|| {
        EngineError::MalformedEditedRequest("missing Host header".to_string())
    })?;
    if !host.eq_ignore_ascii_case(original_host) || !same_port(head.port, original_port, &head.target) {
        return Err(EngineError::EditTargetMismatch {
            original: display_authority(original_host, original_port),
            edited: display_authority(host, head.port),
        });
    }

    let content_lengths: Vec<&str> = header_values(&framed, "content-length").collect();
    let transfer_encodings: Vec<&str> = header_values(&framed, "transfer-encoding").collect();

    if !transfer_encodings.is_empty() {
        if !content_lengths.is_empty() {
            return Err(EngineError::MalformedEditedRequest(
                "both Transfer-Encoding and Content-Length present".to_string(),
            ));
        }
        let last = transfer_encodings
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .last()
            .unwrap_or("");
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(EngineError::MalformedEditedRequest(format!(
                "unsupported Transfer-Encoding '{}'",
                last
            )));
        }
        return Ok(assemble(&framed, None));
    }

    let declared = match content_lengths.as_slice() {
        [] => None,
        [first, rest @ ..] => {
            if rest.iter().any(|v| v.trim() != first.trim()) {
                return Err(EngineError::MalformedEditedRequest(
                    "conflicting Content-Length headers".to_string(),
                ));
            }
            Some(first.trim().parse::<usize>().map_err(|_| {
                EngineError::MalformedEditedRequest(format!(
                    "invalid Content-Length '{}'",
                    first.trim()
                ))
            })?)
        }
    };

    let body_len = framed.body.len();
    let rewrite = match declared {
        Some(n) if n == body_len => None,
        Some(_) => Some(body_len),
        None if body_len > 0 => Some(body_len),
        None => None,
    };

    Ok(assemble(&framed, rewrite))
}

/// Build the response returned to the client for a dropped exchange
pub fn synthesize_failure(status: u16, message: &str) -> Bytes {
    let reason = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let body = format!("{}\n", message);

    let mut out = BytesMut::with_capacity(128 + body.len());
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    out.put_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(body.as_bytes());
    out.freeze()
}

/// Split host and optional port from an authority (`host`, `host:port`, `[v6]:port`)
pub fn split_authority(authority: &str) -> Option<(String, Option<u16>)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((format!("[{}]", host), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), Some(port.parse().ok()?)))
        }
        _ => Some((authority.to_string(), None)),
    }
}

/// An omitted port stands for the scheme's default. Origin-form targets do
/// not name a scheme, so either default matches.
fn same_port(edited: Option<u16>, original: Option<u16>, target: &str) -> bool {
    match (edited, original) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(port), None) | (None, Some(port)) => default_ports(target).contains(&port),
    }
}

fn default_ports(target: &str) -> &'static [u16] {
    if target.starts_with("http://") {
        &[80]
    } else if target.starts_with("https://") {
        &[443]
    } else {
        &[80, 443]
    }
}

fn display_authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    }
}

fn split(raw: &[u8]) -> std::result::Result<Framed<'_>, String> {
    let (head, body) = match find(raw, b"\r\n\r\n") {
        Some(i) => (&raw[..i], &raw[i + 4..]),
        None => match find(raw, b"\n\n") {
            Some(i) => (&raw[..i], &raw[i + 2..]),
            // No blank line: the whole input is the head
            None => (trim_line_end(raw), &raw[raw.len()..]),
        },
    };

    let head = std::str::from_utf8(head).map_err(|_| "request head is not valid UTF-8".to_string())?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let request_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| "empty request".to_string())?;

    let mut header_lines = Vec::new();
    let mut headers = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err("obsolete header line folding".to_string());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("header line without ':' ({})", line))?;
        if !is_token(name) {
            return Err(format!("invalid header name '{}'", name));
        }
        if value.chars().any(|c| c == '\r' || c == '\0') {
            return Err(format!("invalid characters in header '{}'", name));
        }
        header_lines.push(line);
        headers.push((name, value.trim()));
    }

    Ok(Framed {
        request_line,
        header_lines,
        headers,
        body,
    })
}

fn head_of(framed: &Framed<'_>) -> std::result::Result<RequestHead, String> {
    let mut parts = framed.request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !t.is_empty() => (m, t, v),
        _ => return Err(format!("malformed request line '{}'", framed.request_line)),
    };

    if !is_token(method) {
        return Err(format!("invalid method '{}'", method));
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(format!("unsupported HTTP version '{}'", version));
    }

    let header_host = framed
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| *value)
        .collect::<Vec<_>>();
    if header_host.len() > 1 {
        return Err("multiple Host headers".to_string());
    }
    let header_authority = match header_host.first() {
        Some(value) => Some(
            split_authority(value).ok_or_else(|| format!("invalid Host header '{}'", value))?,
        ),
        None => None,
    };

    let (target_authority, path) = split_target(method, target)?;

    if let (Some((th, tp)), Some((hh, hp))) = (&target_authority, &header_authority) {
        if !th.eq_ignore_ascii_case(hh) || (tp.is_some() && hp.is_some() && tp != hp) {
            return Err(format!(
                "request target authority {} disagrees with Host header {}",
                display_authority(th, *tp),
                display_authority(hh, *hp)
            ));
        }
    }

    let (host, port) = match target_authority.or(header_authority) {
        Some((h, p)) => (Some(h), p),
        None => (None, None),
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        host,
        port,
        path,
    })
}

/// Authority (if any) and path of a request target
fn split_target(
    method: &str,
    target: &str,
) -> std::result::Result<(Option<(String, Option<u16>)>, String), String> {
    if target.starts_with('/') || target == "*" {
        return Ok((None, target.to_string()));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let authority =
            split_authority(target).ok_or_else(|| format!("invalid CONNECT target '{}'", target))?;
        return Ok((Some(authority), target.to_string()));
    }

    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .ok_or_else(|| format!("unsupported request target '{}'", target))?;
    let (authority, path) = match rest.find(|c: char| c == '/' || c == '?') {
        Some(i) if rest.as_bytes()[i] == b'/' => (&rest[..i], rest[i..].to_string()),
        Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
        None => (rest, "/".to_string()),
    };
    let authority =
        split_authority(authority).ok_or_else(|| format!("invalid target authority '{}'", authority))?;
    Ok((Some(authority), path))
}

fn header_values<'a>(framed: &'a Framed<'a>, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    framed
        .headers
        .iter()
        .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

fn assemble(framed: &Framed<'_>, content_length: Option<usize>) -> Bytes {
    let mut out = BytesMut::with_capacity(framed.request_line.len() + 64 + framed.body.len());
    out.put_slice(framed.request_line.as_bytes());
    out.put_slice(b"\r\n");

    let mut wrote_length = false;
    for (line, (name, _)) in framed.header_lines.iter().zip(framed.headers.iter()) {
        match content_length {
            Some(len) if name.eq_ignore_ascii_case("content-length") => {
                if !wrote_length {
                    out.put_slice(format!("{}: {}\r\n", name, len).as_bytes());
                    wrote_length = true;
                }
            }
            _ => {
                out.put_slice(line.as_bytes());
                out.put_slice(b"\r\n");
            }
        }
    }
    if let (Some(len), false) = (content_length, wrote_length) {
        out.put_slice(format!("Content-Length: {}\r\n", len).as_bytes());
    }

    out.put_slice(b"\r\n");
    out.put_slice(framed.body);
    out.freeze()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    &raw[..end]
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}
