//! Line-oriented HTTP relay with credential inspection.
//!
//! One exchange is relayed in three passes:
//!
//! 1. [`relay_request`]: request line and headers, client to destination.
//!    `Authorization: Basic` payloads are decoded along the way.
//! 2. [`relay_response_headers`]: status line and headers, destination to
//!    client.  Records the body framing.
//! 3. [`relay_body`]: the response body, framed by `Content-Length` or by
//!    chunked transfer encoding.
//!
//! Lines are read as raw bytes up to `\n`.  Header text is only ever inspected
//! through a lossy UTF-8 view; the bytes forwarded are the bytes received.

use crate::config::ChunkLineEnding;
use crate::error::Error;
use base64::Engine;
use std::fmt::Display;
use std::io::{BufRead, Read, Write};

/// Longest line accepted in any pass, terminator included.
pub const MAX_LINE_LEN: u64 = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A Basic-auth credential seen in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Decoded `user:password`.
    pub userinfo: String,
    pub host: Option<String>,
    pub path: Option<String>,
}

impl Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "http://{}@{}{}",
            self.userinfo,
            self.host.as_deref().unwrap_or(""),
            self.path.as_deref().unwrap_or("")
        )
    }
}

/// Collects the pieces of a [`Credential`] while request headers stream past.
#[derive(Debug, Default)]
struct CredentialCapture {
    userinfo: Option<String>,
    host: Option<String>,
    path: Option<String>,
}

impl CredentialCapture {
    fn request_line(&mut self, line: &str) {
        if let Some((method, rest)) = line.split_once(' ')
            && method == "GET"
        {
            let path = rest.split(' ').next().unwrap_or("");
            self.path = Some(path.to_string());
        }
    }

    fn header(&mut self, line: &str) {
        let Some((name, value)) = line.split_once(' ') else {
            return;
        };
        if name.eq_ignore_ascii_case("Authorization:") {
            self.userinfo = decode_basic(value.trim());
        } else if name.eq_ignore_ascii_case("Host:") {
            self.host = Some(value.trim().to_string());
        }
    }

    fn finish(self) -> Option<Credential> {
        Some(Credential {
            userinfo: self.userinfo?,
            host: self.host,
            path: self.path,
        })
    }
}

/// Decodes the value of an `Authorization` header if it uses the Basic scheme.
pub fn decode_basic(value: &str) -> Option<String> {
    let (scheme, payload) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }
    match base64::prelude::BASE64_STANDARD.decode(payload.trim()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            logwise::warn_sync!(
                "Undecodable Basic credential: {e}",
                e = logwise::privacy::LogIt(&e)
            );
            None
        }
    }
}

/// One line as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    raw: Vec<u8>,
    content_len: usize,
}

impl Line {
    /// The line without its terminator.
    pub fn content(&self) -> &[u8] {
        &self.raw[..self.content_len]
    }

    /// The line exactly as received, terminator included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.content_len == 0
    }

    /// False for a segment cut off by a read limit or end of stream.
    pub fn is_terminated(&self) -> bool {
        self.raw.last() == Some(&b'\n')
    }

    fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }
}

/// Reads one line up to and including `\n`.
///
/// Returns `Ok(None)` at end of stream.  A final line without a terminator is
/// still returned.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<Line>, Error> {
    let line = read_segment(reader, MAX_LINE_LEN)?;
    if let Some(line) = &line
        && !line.is_terminated()
        && line.raw.len() as u64 == MAX_LINE_LEN
    {
        return Err(Error::framing(format!("line longer than {MAX_LINE_LEN} bytes")));
    }
    Ok(line)
}

/// Reads up to `limit` bytes, stopping after the first `\n`.
fn read_segment<R: BufRead>(reader: &mut R, limit: u64) -> Result<Option<Line>, Error> {
    let mut raw = Vec::new();
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut raw)?;
    if read == 0 {
        return Ok(None);
    }
    let mut content_len = raw.len();
    if raw.last() == Some(&b'\n') {
        content_len -= 1;
        if content_len > 0 && raw[content_len - 1] == b'\r' {
            content_len -= 1;
        }
    }
    Ok(Some(Line { raw, content_len }))
}

fn expect_line<R: BufRead>(reader: &mut R, what: &str) -> Result<Line, Error> {
    read_line(reader)?.ok_or_else(|| Error::framing(format!("end of stream while reading {what}")))
}

/// Forwards the request line and headers from `client` to `destination`.
///
/// Every line, including the empty line that ends the header block, is
/// forwarded followed by `\r\n`.  No request body is forwarded.  Returns the
/// Basic credential carried by the request, if any.
pub fn relay_request<R: BufRead, W: Write>(
    client: &mut R,
    destination: &mut W,
) -> Result<Option<Credential>, Error> {
    let mut capture = CredentialCapture::default();
    let mut first = true;
    loop {
        let line = expect_line(client, "request headers")?;
        destination.write_all(line.content())?;
        destination.write_all(CRLF)?;
        if line.is_empty() {
            break;
        }
        let text = line.text();
        if first {
            capture.request_line(&text);
            first = false;
        } else {
            capture.header(&text);
        }
    }
    destination.flush()?;
    Ok(capture.finish())
}

/// How a response body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    ContentLength,
    Chunked,
    /// No framing header; nothing is forwarded after the headers.
    #[default]
    NoBody,
}

/// Counters for the response being relayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    /// Bytes written to the client for this response, headers included.
    pub bytes_forwarded: u64,
    pub content_length: Option<u64>,
    /// Bytes still owed by the current chunk.
    pub chunk_remaining: u64,
    pub mode: TransferMode,
}

impl RelayState {
    fn write<W: Write>(&mut self, out: &mut W, bytes: &[u8]) -> Result<(), Error> {
        out.write_all(bytes)?;
        self.bytes_forwarded += bytes.len() as u64;
        Ok(())
    }

    fn forward_header<W: Write>(&mut self, out: &mut W, line: &Line) -> Result<(), Error> {
        self.write(out, line.content())?;
        self.write(out, CRLF)
    }

    fn forward_chunk_line<W: Write>(
        &mut self,
        out: &mut W,
        line: &Line,
        ending: ChunkLineEnding,
    ) -> Result<(), Error> {
        match ending {
            ChunkLineEnding::Lf if line.is_terminated() => {
                self.write(out, line.content())?;
                self.write(out, b"\n")
            }
            _ => self.write(out, line.raw()),
        }
    }
}

/// Forwards the status line and headers from `destination` to `client`.
///
/// Stops after forwarding the first empty line and returns the body framing
/// found on the way.
pub fn relay_response_headers<R: BufRead, W: Write>(
    destination: &mut R,
    client: &mut W,
) -> Result<RelayState, Error> {
    let mut state = RelayState::default();
    let mut chunked = false;
    loop {
        let line = expect_line(destination, "response headers")?;
        state.forward_header(client, &line)?;
        if line.is_empty() {
            break;
        }
        let text = line.text();
        let Some((name, value)) = text.split_once(' ') else {
            continue;
        };
        if name.eq_ignore_ascii_case("Content-Length:") {
            let length = value.trim().parse::<u64>().map_err(|_| {
                Error::framing(format!("invalid Content-Length {:?}", value.trim()))
            })?;
            state.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("Transfer-Encoding:")
            && value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        {
            chunked = true;
        }
    }
    client.flush()?;
    state.mode = match state.content_length {
        Some(length) if length > 0 => TransferMode::ContentLength,
        _ if chunked => TransferMode::Chunked,
        _ => TransferMode::NoBody,
    };
    Ok(state)
}

/// Forwards the response body according to `state.mode`.
pub fn relay_body<R: BufRead, W: Write>(
    destination: &mut R,
    client: &mut W,
    state: &mut RelayState,
    chunk_line_ending: ChunkLineEnding,
) -> Result<(), Error> {
    match state.mode {
        TransferMode::ContentLength => {
            let length = state.content_length.unwrap_or(0);
            let copied = std::io::copy(&mut destination.by_ref().take(length), client)?;
            state.bytes_forwarded += copied;
            if copied < length {
                return Err(Error::framing(format!(
                    "body ended after {copied} of {length} bytes"
                )));
            }
        }
        TransferMode::Chunked => relay_chunks(destination, client, state, chunk_line_ending)?,
        TransferMode::NoBody => {}
    }
    client.flush()?;
    Ok(())
}

fn relay_chunks<R: BufRead, W: Write>(
    destination: &mut R,
    client: &mut W,
    state: &mut RelayState,
    ending: ChunkLineEnding,
) -> Result<(), Error> {
    let mut first = true;
    loop {
        let mut size_line = expect_line(destination, "chunk size")?;
        // chunk data ending on a newline leaves its CRLF as an empty line
        if size_line.is_empty() && !first {
            state.forward_chunk_line(client, &size_line, ending)?;
            size_line = expect_line(destination, "chunk size")?;
        }
        first = false;
        state.forward_chunk_line(client, &size_line, ending)?;
        let size = parse_chunk_size(size_line.content())?;
        if size == 0 {
            break;
        }
        state.chunk_remaining = size;
        while state.chunk_remaining > 0 {
            // chunk data may run past MAX_LINE_LEN without a newline
            let limit = state
                .chunk_remaining
                .saturating_add(CRLF.len() as u64)
                .min(MAX_LINE_LEN);
            let line = read_segment(destination, limit)?
                .ok_or_else(|| Error::framing("end of stream while reading chunk data"))?;
            state.forward_chunk_line(client, &line, ending)?;
            state.chunk_remaining = state.chunk_remaining.saturating_sub(line.raw().len() as u64);
        }
    }
    // trailer section, normally just the empty line
    while let Some(line) = read_line(destination)? {
        state.forward_chunk_line(client, &line, ending)?;
        if line.is_empty() {
            break;
        }
    }
    Ok(())
}

/// Parses a chunk-size line, ignoring any chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, Error> {
    let text = String::from_utf8_lossy(line);
    let digits = text.split(';').next().unwrap_or("").trim();
    // from_str_radix would take a leading '+'
    if !digits.starts_with(|c: char| c.is_ascii_hexdigit()) {
        return Err(Error::framing(format!("invalid chunk size {digits:?}")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::framing(format!("invalid chunk size {digits:?}")))
}
