//! Streaming web-archive reader.
//!
//! Frames `WARC/1.0` records, slices the HTTP header prefix off `response`
//! payloads, resolves `revisit` records through a response table shared
//! across files, and associates `request` records to their response via
//! `WARC-Concurrent-To`. Payloads become byte-range blobs over the archive
//! file, which therefore stays open as long as any of them is alive.
//!
//! A `.warc.open` file that is still being appended to is read up to the last
//! complete record; the returned end offset lets a later pass resume there.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};

use spdlog::prelude::*;

use crate::blob::{Blob, BlobKind, SharedFile, Transport};
use crate::error::{Error, Result};

/// One captured HTTP exchange: a response (or revisit) record, optionally
/// joined by its request record.
#[derive(Clone)]
pub struct WarcRecord {
    pub date: String,
    pub target_uri: String,
    pub request_headers: Option<Vec<String>>,
    pub response_headers: Vec<String>,
    pub payload: Blob,
}

impl WarcRecord {
    pub fn status_line(&self) -> &str {
        self.response_headers.first().map(String::as_str).unwrap_or("")
    }

    pub fn request_header(&self, name: &str) -> Option<String> {
        header_value(self.request_headers.as_deref()?, name)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(
            &self.payload.kind,
            BlobKind::InWarc {
                transport: Transport::Chunked,
                ..
            }
        )
    }
}

fn header_value(lines: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}: ");
    lines.iter().find_map(|line| {
        (line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(&prefix))
            .then(|| line[prefix.len()..].trim_end_matches("\r\n").to_owned())
    })
}

/// Reads records from `start` to the end of the file (or the last complete
/// record). Returns the record ids of responses/revisits in file order and
/// the offset to resume from. `responses` persists across calls and across
/// files so that revisits can refer backwards.
pub fn read_warc(
    file: &SharedFile,
    start: u64,
    responses: &mut HashMap<String, WarcRecord>,
) -> Result<(Vec<String>, u64)> {
    let raw = file.borrow().try_clone()?;
    let mut f = BufReader::new(raw);
    f.seek(SeekFrom::Start(start))?;

    let mut order = Vec::new();
    let mut resume = start;

    loop {
        match read_record(file, &mut f, responses) {
            Ok(Some(record_id)) => {
                if let Some(id) = record_id {
                    order.push(id);
                }
                resume = f.stream_position()?;
            }
            Ok(None) => break, // clean end of file
            Err(err) => {
                // Most commonly a partially-written tail record.
                warn!("stopping warc read at offset {resume}: {err}");
                break;
            }
        }
    }

    Ok((order, resume))
}

/// One record. `Ok(None)` = end of file, `Ok(Some(None))` = record consumed
/// but not a response, `Ok(Some(Some(id)))` = response/revisit stored.
#[allow(clippy::type_complexity)]
fn read_record(
    shared: &SharedFile,
    f: &mut BufReader<std::fs::File>,
    responses: &mut HashMap<String, WarcRecord>,
) -> Result<Option<Option<String>>> {
    let mut line = String::new();
    if f.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line != "WARC/1.0\r\n" {
        return Err(Error::corrupt(format!("bad record magic {line:?}")));
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut length: Option<u64> = None;
    loop {
        let mut header_line = String::new();
        if f.read_line(&mut header_line)? == 0 {
            return Err(Error::corrupt("truncated record header"));
        }
        if header_line == "\r\n" {
            break;
        }
        let Some((name, value)) = header_line.trim_end_matches("\r\n").split_once(": ") else {
            return Err(Error::corrupt(format!("bad record header {header_line:?}")));
        };
        if name.eq_ignore_ascii_case("content-length") {
            length = value
                .parse()
                .map_err(|_| Error::corrupt("bad content-length"))
                .map(Some)?;
        }
        headers.push((name.to_ascii_lowercase(), value.to_owned()));
    }

    let offset = f.stream_position()?;
    let length = length.ok_or_else(|| Error::corrupt("record without content-length"))?;
    let header = |name: &str| {
        headers
            .iter()
            .find_map(|(n, v)| (n == name).then(|| v.clone()))
    };

    let warc_type = header("warc-type").unwrap_or_default();
    let end = offset + length;

    match warc_type.as_str() {
        "warcinfo" => {}

        "response" => {
            let record_id = header("warc-record-id")
                .ok_or_else(|| Error::corrupt("response without record id"))?;
            let http_headers = read_header_lines_limited(f, end)?;
            let payload_begin = f.stream_position()?;

            let mut transport = Transport::Identity;
            let mut mime = None;
            for h in &http_headers {
                let lower = h.to_ascii_lowercase();
                if let Some(rest) = lower.strip_prefix("content-encoding: ") {
                    transport = match rest.trim_end_matches("\r\n") {
                        "gzip" => Transport::Gzip,
                        "br" => Transport::Brotli,
                        _ => Transport::Identity,
                    };
                }
                if lower.starts_with("content-type: ") {
                    mime = Some(h["content-type: ".len()..].trim_end_matches("\r\n").to_owned());
                }
            }
            if http_headers
                .iter()
                .any(|h| h.to_ascii_lowercase() == "transfer-encoding: chunked\r\n")
            {
                transport = Transport::Chunked;
            }

            let payload = Blob {
                kind: BlobKind::InWarc {
                    file: shared.clone(),
                    offset: payload_begin,
                    len: end.saturating_sub(payload_begin),
                    transport,
                },
                mime,
            };
            let record = WarcRecord {
                date: header("warc-date").unwrap_or_default(),
                target_uri: header("warc-target-uri").unwrap_or_default(),
                request_headers: None,
                response_headers: http_headers,
                payload,
            };
            if responses.insert(record_id.clone(), record).is_some() {
                warn!("duplicate warc record id {record_id}");
            }
            finish_record(f, end)?;
            return Ok(Some(Some(record_id)));
        }

        "revisit" => {
            let record_id = header("warc-record-id")
                .ok_or_else(|| Error::corrupt("revisit without record id"))?;
            let http_headers = read_header_lines_limited(f, end)?;
            let referred = header("warc-refers-to").and_then(|id| responses.get(&id).cloned());
            match referred {
                Some(original) => {
                    let record = WarcRecord {
                        date: header("warc-date").unwrap_or_default(),
                        target_uri: header("warc-target-uri").unwrap_or_default(),
                        request_headers: None,
                        response_headers: http_headers,
                        payload: original.payload.clone(),
                    };
                    responses.insert(record_id.clone(), record);
                    finish_record(f, end)?;
                    return Ok(Some(Some(record_id)));
                }
                None => {
                    warn!("revisit {record_id} refers to an unknown response, skipping");
                }
            }
        }

        "request" => {
            let http_headers = read_header_lines_limited(f, end)?;
            for (name, value) in &headers {
                if name == "warc-concurrent-to" {
                    if let Some(response) = responses.get_mut(value) {
                        response.request_headers = Some(http_headers.clone());
                    }
                }
            }
        }

        other => {
            debug!("skipping warc record of type {other:?}");
        }
    }

    finish_record(f, end)?;
    Ok(Some(None))
}

/// Skips to the end of the record content and consumes the two blank lines
/// that separate records.
fn finish_record(f: &mut BufReader<std::fs::File>, end: u64) -> Result<()> {
    f.seek(SeekFrom::Start(end))?;
    for _ in 0..2 {
        let mut blank = String::new();
        if f.read_line(&mut blank)? == 0 || blank != "\r\n" {
            return Err(Error::corrupt("record not followed by blank lines"));
        }
    }
    Ok(())
}

/// HTTP header lines bounded by the record's content-length; stops early at
/// the blank separator line and truncates a line crossing the boundary.
fn read_header_lines_limited(
    f: &mut BufReader<std::fs::File>,
    stop: u64,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut offset = f.stream_position()?;
    loop {
        let mut raw = Vec::new();
        if f.read_until(b'\n', &mut raw)? == 0 {
            return Err(Error::corrupt("truncated http headers"));
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        if line == "\r\n" {
            break;
        }
        let next = offset + raw.len() as u64;
        if next > stop {
            let keep = (stop - offset) as usize;
            lines.push(String::from_utf8_lossy(&raw[..keep]).into_owned());
            break;
        }
        lines.push(line);
        if next == stop {
            break;
        }
        offset = next;
    }
    Ok(lines)
}

/// Cookie-header parsing that tolerates the braces, commas, and mid-value
/// quotes seen in production captures (`g_state={"i_p":99,"i_l":3}`).
pub fn parse_cookie_header(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|piece| {
            let (name, value) = piece.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    fn warc_record(kind: &str, id: &str, uri: &str, extra: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut headers = format!(
            "WARC/1.0\r\nWARC-Type: {kind}\r\nWARC-Record-ID: {id}\r\nWARC-Date: 2024-05-01T12:00:00Z\r\nWARC-Target-URI: {uri}\r\n"
        );
        for (name, value) in extra {
            headers.push_str(&format!("{name}: {value}\r\n"));
        }
        headers.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut record = headers.into_bytes();
        record.extend_from_slice(body);
        record.extend_from_slice(b"\r\n\r\n");
        record
    }

    fn http_response(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{body}"
        )
        .into_bytes()
    }

    fn write_temp(data: &[u8]) -> SharedFile {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        Rc::new(RefCell::new(f))
    }

    #[test]
    fn response_payload_and_request_cookies() {
        let mut data = Vec::new();
        data.extend(warc_record(
            "response",
            "<urn:uuid:res-1>",
            "https://x.com/i/api/graphql/q/UserTweets",
            &[],
            &http_response("{\"data\":{}}"),
        ));
        data.extend(warc_record(
            "request",
            "<urn:uuid:req-1>",
            "https://x.com/i/api/graphql/q/UserTweets",
            &[("WARC-Concurrent-To", "<urn:uuid:res-1>")],
            b"GET /i/api/graphql/q/UserTweets HTTP/1.1\r\nCookie: twid=u%3D1234; g_state={\"i_p\":9,\"i_l\":3}\r\n\r\n",
        ));

        let file = write_temp(&data);
        let mut responses = HashMap::new();
        let (order, end) = read_warc(&file, 0, &mut responses).unwrap();
        assert_eq!(order, vec!["<urn:uuid:res-1>".to_owned()]);
        assert_eq!(end, data.len() as u64);

        let record = &responses["<urn:uuid:res-1>"];
        assert_eq!(record.payload.read().unwrap(), b"{\"data\":{}}");
        assert!(record.status_line().starts_with("HTTP/1.1 200"));
        let cookie = record.request_header("Cookie").unwrap();
        let cookies = parse_cookie_header(&cookie);
        assert!(cookies.contains(&("twid".to_owned(), "u%3D1234".to_owned())));
        assert!(cookies.contains(&(
            "g_state".to_owned(),
            "{\"i_p\":9,\"i_l\":3}".to_owned()
        )));
    }

    #[test]
    fn revisit_resolves_to_referenced_payload() {
        let mut data = Vec::new();
        data.extend(warc_record(
            "response",
            "<urn:uuid:res-1>",
            "https://pbs.twimg.com/media/A.jpg",
            &[],
            &http_response("image-bytes"),
        ));
        data.extend(warc_record(
            "revisit",
            "<urn:uuid:rev-1>",
            "https://pbs.twimg.com/media/A.jpg",
            &[("WARC-Refers-To", "<urn:uuid:res-1>")],
            b"HTTP/1.1 304 Not Modified\r\n\r\n",
        ));

        let file = write_temp(&data);
        let mut responses = HashMap::new();
        let (order, _) = read_warc(&file, 0, &mut responses).unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(
            responses["<urn:uuid:rev-1>"].payload.read().unwrap(),
            b"image-bytes"
        );
    }

    #[test]
    fn truncated_tail_resumes_at_last_complete_record() {
        let complete = warc_record(
            "response",
            "<urn:uuid:res-1>",
            "https://x.com/i/api/x",
            &[],
            &http_response("{}"),
        );
        let mut data = complete.clone();
        data.extend_from_slice(b"WARC/1.0\r\nWARC-Type: response\r\nWARC-Rec"); // torn write

        let file = write_temp(&data);
        let mut responses = HashMap::new();
        let (order, end) = read_warc(&file, 0, &mut responses).unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(end, complete.len() as u64);
    }

    #[test]
    fn chunked_responses_are_marked() {
        let body = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let data = warc_record(
            "response",
            "<urn:uuid:res-1>",
            "https://x.com/i/api/x",
            &[],
            body,
        );
        let file = write_temp(&data);
        let mut responses = HashMap::new();
        read_warc(&file, 0, &mut responses).unwrap();
        assert!(responses["<urn:uuid:res-1>"].is_chunked());
    }
}
