use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::Version;
use std::io::{Read, Write};
use tracing::trace;

use crate::flow::{Direction, FlowEntry, RAW_KIND};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_item_size: usize,
    pub session_tracking: bool,
}

/// Recognizes HTTP in raw items, decompresses response bodies in place and
/// collects cookie fingerprints. Items that do not parse stay untouched.
pub fn process_flow(flow: &mut FlowEntry, config: &HttpConfig) {
    let mut tagged = false;
    let mut fingerprints = vec![];

    for idx in 0..flow.items.len() {
        let item = &flow.items[idx];
        if item.kind != RAW_KIND {
            continue;
        }

        match item.direction {
            Direction::ClientToServer => {
                let Some(request) = parse_request(&item.payload) else {
                    continue;
                };
                tagged = true;
                if config.session_tracking {
                    fingerprints.extend(request.cookies.iter().map(|(k, v)| fingerprint(k, v)));
                }
            }
            Direction::ServerToClient => {
                let Some(response) = parse_response(&item.payload) else {
                    continue;
                };
                tagged = true;
                if config.session_tracking {
                    fingerprints.extend(response.cookies.iter().map(|(k, v)| fingerprint(k, v)));
                }

                let Some(replacement) = decode_body(&response, config.max_item_size) else {
                    continue;
                };

                // Only swap the payload if the flow stays under its cap
                let old_len = flow.items[idx].payload.len();
                let new_size = flow.size_bytes - old_len + replacement.len();
                if new_size <= config.max_item_size {
                    flow.size_bytes = new_size;
                    flow.items[idx].payload = Bytes::from(replacement);
                }
            }
        }
    }

    if tagged {
        flow.add_tag("http");
    }
    flow.fingerprints.extend(fingerprints);
}

/// `crc32(ieee, urlencode(name) + "=" + urlencode(value))`. Encoding first
/// keeps a hostile cookie value from forging another session's pair.
pub fn fingerprint(name: &str, value: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    let name: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
    let value: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
    hasher.update(name.as_bytes());
    hasher.update(b"=");
    hasher.update(value.as_bytes());
    hasher.finalize()
}

struct ParsedRequest {
    cookies: Vec<(String, String)>,
}

struct ParsedResponse {
    version: Version,
    status: u16,
    /// Original wire order, values as raw bytes
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    cookies: Vec<(String, String)>,
}

fn parse_request(payload: &[u8]) -> Option<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(payload) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let mut cookies = vec![];
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("cookie")
            && let Ok(value) = str::from_utf8(header.value)
        {
            for pair in value.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.push((name.to_string(), value.to_string()));
                }
            }
        }
    }

    Some(ParsedRequest { cookies })
}

fn parse_response(payload: &[u8]) -> Option<ParsedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response.parse(payload) {
        Ok(httparse::Status::Complete(len)) => len,
        _ => return None,
    };

    let version = match response.version? {
        0 => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let status = response.code?;

    let mut parsed_headers = vec![];
    let mut cookies = vec![];
    let mut content_length = None;
    for header in response.headers.iter() {
        parsed_headers.push((header.name.to_string(), header.value.to_vec()));
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok());
        }
        if header.name.eq_ignore_ascii_case("set-cookie")
            && let Ok(value) = str::from_utf8(header.value)
            && let Some((name, value)) = value.split(';').next().and_then(|kv| kv.split_once('='))
        {
            cookies.push((name.trim().to_string(), value.to_string()));
        }
    }

    let rest = &payload[header_len..];
    let body = match content_length {
        Some(length) if length <= rest.len() => rest[..length].to_vec(),
        _ => rest.to_vec(),
    };

    Some(ParsedResponse {
        version,
        status,
        headers: parsed_headers,
        body,
        cookies,
    })
}

/// Decompresses a gzip/deflate/br response body and re-serializes the whole
/// message without its `Content-Encoding` header. `None` leaves the raw item
/// in place: unknown or multi-valued encodings and codec failures all fall
/// through.
fn decode_body(response: &ParsedResponse, size_limit: usize) -> Option<Vec<u8>> {
    let encodings: Vec<&[u8]> = response
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("content-encoding"))
        .map(|(_, value)| value.as_slice())
        .collect();
    let encoding = match encodings[..] {
        [one] => one,
        _ => return None,
    };

    let body = response.body.as_slice();
    let mut decoded = vec![];
    // Cap the read to guard against decompression bombs
    let result = if encoding == b"gzip" {
        MultiGzDecoder::new(body)
            .take(size_limit as u64)
            .read_to_end(&mut decoded)
    } else if encoding == b"deflate" {
        ZlibDecoder::new(body)
            .take(size_limit as u64)
            .read_to_end(&mut decoded)
    } else if encoding == b"br" {
        brotli::Decompressor::new(body, 4096)
            .take(size_limit as u64)
            .read_to_end(&mut decoded)
    } else {
        return None;
    };
    if result.is_err() {
        trace!("Failed to decode response body, leaving raw form in place");
        return None;
    }

    Some(serialize_response(response, &decoded))
}

fn serialize_response(response: &ParsedResponse, body: &[u8]) -> Vec<u8> {
    let version = match response.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = http::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("");

    let mut buf = Vec::with_capacity(body.len() + 256);
    write!(&mut buf, "{} {} {}\r\n", version, response.status, reason).unwrap();
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-encoding") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            write!(&mut buf, "Content-Length: {}\r\n", body.len()).unwrap();
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowItem;
    use chrono::{TimeZone, Utc};
    use flate2::write::GzEncoder;

    fn item(direction: Direction, payload: &[u8]) -> FlowItem {
        FlowItem {
            kind: RAW_KIND.to_string(),
            direction,
            payload: Bytes::copy_from_slice(payload),
            time: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    fn flow_of(items: Vec<FlowItem>) -> FlowEntry {
        let size = items.iter().map(|i| i.payload.len()).sum();
        let mut flow = FlowEntry::from_items(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            40000,
            80,
            items.len() as u32,
            size,
            "test.pcap".into(),
            "tcp",
            items,
        )
        .unwrap();
        flow.size_bytes = size;
        flow
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(vec![], flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn gzip_response(body: &[u8]) -> Vec<u8> {
        let compressed = gzip(body);
        let mut payload = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        payload.extend_from_slice(&compressed);
        payload
    }

    #[test]
    fn gzip_response_is_decoded_in_place() {
        let mut flow = flow_of(vec![
            item(Direction::ClientToServer, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"),
            item(Direction::ServerToClient, &gzip_response(b"hello")),
        ]);

        let config = HttpConfig {
            max_item_size: 1 << 20,
            session_tracking: false,
        };
        process_flow(&mut flow, &config);

        assert!(flow.tags.contains("http"));
        let payload = flow.items[1].payload.clone();
        let text = String::from_utf8_lossy(&payload);
        assert!(text.ends_with("hello"));
        assert!(!text.to_ascii_lowercase().contains("content-encoding"));

        // The rewritten item must still parse as a response
        let reparsed = parse_response(&payload).expect("rewritten response parses");
        assert_eq!(reparsed.status, 200);
        assert_eq!(reparsed.body, b"hello");
        assert!(
            !reparsed
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-encoding"))
        );
    }

    #[test]
    fn brotli_response_is_decoded() {
        let mut compressed = vec![];
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(b"brotli body").unwrap();
        }
        let mut payload = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: br\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        payload.extend_from_slice(&compressed);

        let mut flow = flow_of(vec![item(Direction::ServerToClient, &payload)]);
        process_flow(
            &mut flow,
            &HttpConfig {
                max_item_size: 1 << 20,
                session_tracking: false,
            },
        );
        assert!(String::from_utf8_lossy(&flow.items[0].payload).ends_with("brotli body"));
    }

    #[test]
    fn oversized_decode_keeps_raw_form() {
        let body = vec![b'a'; 4096];
        let mut flow = flow_of(vec![item(Direction::ServerToClient, &gzip_response(&body))]);
        let raw = flow.items[0].payload.clone();

        process_flow(
            &mut flow,
            &HttpConfig {
                max_item_size: 256,
                session_tracking: false,
            },
        );
        assert_eq!(flow.items[0].payload, raw);
    }

    #[test]
    fn multi_valued_encoding_is_skipped() {
        let payload =
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Encoding: br\r\nContent-Length: 3\r\n\r\nabc";
        let mut flow = flow_of(vec![item(Direction::ServerToClient, payload)]);
        let raw = flow.items[0].payload.clone();

        process_flow(
            &mut flow,
            &HttpConfig {
                max_item_size: 1 << 20,
                session_tracking: false,
            },
        );
        assert_eq!(flow.items[0].payload, raw);
        assert!(flow.tags.contains("http"));
    }

    #[test]
    fn cookies_fingerprint_both_directions() {
        let mut flow = flow_of(vec![
            item(
                Direction::ClientToServer,
                b"GET / HTTP/1.1\r\nCookie: session=abc; theme=dark\r\n\r\n",
            ),
            item(
                Direction::ServerToClient,
                b"HTTP/1.1 200 OK\r\nSet-Cookie: session=def; HttpOnly\r\nContent-Length: 0\r\n\r\n",
            ),
        ]);

        process_flow(
            &mut flow,
            &HttpConfig {
                max_item_size: 1 << 20,
                session_tracking: true,
            },
        );

        assert!(flow.fingerprints.contains(&fingerprint("session", "abc")));
        assert!(flow.fingerprints.contains(&fingerprint("theme", "dark")));
        assert!(flow.fingerprints.contains(&fingerprint("session", "def")));
        assert_eq!(flow.fingerprints.len(), 3);
    }

    #[test]
    fn non_http_items_stay_raw() {
        let mut flow = flow_of(vec![item(Direction::ClientToServer, b"\x00\x01binary junk")]);
        process_flow(
            &mut flow,
            &HttpConfig {
                max_item_size: 1 << 20,
                session_tracking: true,
            },
        );
        assert!(!flow.tags.contains("http"));
        assert!(flow.fingerprints.is_empty());
    }
}
