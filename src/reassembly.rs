// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Incremental reassembly of HTTP/1.x messages from a raw byte stream.
//!
//! One reassembler serves one direction of a tunnel. Bytes are fed as they
//! are forwarded; the reassembler either completes exactly one message
//! (start line + headers + fully resolved, de-chunked body) or reports
//! that it needs more data. Parsing failures degrade observability only;
//! the forwarding path never depends on reassembly succeeding.

use crate::error::{ProxyError, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upper bound on bytes buffered while hunting for the header terminator.
/// Streams that never frame a header block (e.g. non-HTTP protocols inside
/// the tunnel) would otherwise grow the buffer forever.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Outcome of one `feed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The buffer does not yet hold a full message. Not an error.
    NeedMoreData,
    /// Exactly one message is complete and available.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHeaders,
    /// Fixed-length body; `total_len` covers head plus declared body.
    AwaitingBody { total_len: usize },
    AwaitingChunkedBody,
    Complete,
}

/// A completed message borrowed from the reassembler, valid until `reset`.
#[derive(Debug)]
pub struct CompletedMessage<'a> {
    /// Start line + headers + resolved body (chunk framing removed).
    pub raw: &'a [u8],
    pub content_type: &'a str,
    head_len: usize,
}

impl<'a> CompletedMessage<'a> {
    pub fn body(&self) -> &'a [u8] {
        &self.raw[self.head_len..]
    }

    /// The message start line, e.g. `GET /x HTTP/1.1` or `HTTP/1.1 200 OK`.
    pub fn start_line(&self) -> String {
        let head = &self.raw[..self.head_len];
        let end = find_subsequence(head, b"\r\n").unwrap_or(head.len());
        String::from_utf8_lossy(&head[..end]).into_owned()
    }
}

/// Pull-based incremental framer: `AwaitingHeaders -> AwaitingBody ->
/// Complete`, back to `AwaitingHeaders` on `reset`.
#[derive(Debug)]
pub struct MessageReassembler {
    /// Unconsumed stream bytes, starting at the current message boundary.
    buffer: Vec<u8>,
    phase: Phase,
    head_len: usize,
    content_type: String,
    /// Head + resolved body, populated on completion.
    message: Vec<u8>,
    /// Armed after a complete-but-malformed chunk-size line; a second
    /// failure over the same line classifies as a framing error.
    chunk_fault: bool,
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReassembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            phase: Phase::AwaitingHeaders,
            head_len: 0,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            message: Vec::new(),
            chunk_fault: false,
        }
    }

    /// Appends `data` and advances the state machine as far as possible.
    pub fn feed(&mut self, data: &[u8]) -> Result<FeedOutcome> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.phase {
                Phase::AwaitingHeaders => {
                    let Some(pos) = find_subsequence(&self.buffer, HEADER_TERMINATOR) else {
                        if self.buffer.len() > MAX_HEAD_BYTES {
                            return Err(ProxyError::Framing(format!(
                                "no header terminator within {MAX_HEAD_BYTES} bytes"
                            )));
                        }
                        return Ok(FeedOutcome::NeedMoreData);
                    };
                    self.head_len = pos + HEADER_TERMINATOR.len();
                    let head = HeadFields::parse(&self.buffer[..self.head_len])?;
                    self.content_type = head.content_type;
                    self.phase = if head.chunked {
                        Phase::AwaitingChunkedBody
                    } else {
                        Phase::AwaitingBody {
                            total_len: self.head_len + head.content_length,
                        }
                    };
                }
                Phase::AwaitingBody { total_len } => {
                    if self.buffer.len() < total_len {
                        return Ok(FeedOutcome::NeedMoreData);
                    }
                    self.message = self.buffer[..total_len].to_vec();
                    self.buffer.drain(..total_len);
                    self.phase = Phase::Complete;
                    return Ok(FeedOutcome::Complete);
                }
                Phase::AwaitingChunkedBody => match decode_chunked(&self.buffer[self.head_len..]) {
                    ChunkProgress::Done { consumed, body } => {
                        self.message = self.buffer[..self.head_len].to_vec();
                        self.message.extend_from_slice(&body);
                        self.buffer.drain(..self.head_len + consumed);
                        self.chunk_fault = false;
                        self.phase = Phase::Complete;
                        return Ok(FeedOutcome::Complete);
                    }
                    ChunkProgress::Incomplete => return Ok(FeedOutcome::NeedMoreData),
                    ChunkProgress::Malformed(token) => {
                        // The slice may simply be truncated mid-message;
                        // only an unchanged failure after further input is
                        // conclusive.
                        if self.chunk_fault {
                            return Err(ProxyError::Framing(format!(
                                "invalid chunk size line {token:?}"
                            )));
                        }
                        self.chunk_fault = true;
                        return Ok(FeedOutcome::NeedMoreData);
                    }
                },
                Phase::Complete => return Ok(FeedOutcome::Complete),
            }
        }
    }

    /// The completed message; fails with `NotReady` before completion.
    pub fn completed_message(&self) -> Result<CompletedMessage<'_>> {
        if self.phase != Phase::Complete {
            return Err(ProxyError::NotReady);
        }
        Ok(CompletedMessage {
            raw: &self.message,
            content_type: &self.content_type,
            head_len: self.head_len,
        })
    }

    /// Clears per-message state and resynchronizes on the next boundary.
    /// Trailing bytes already received stay buffered for the next message.
    pub fn reset(&mut self) {
        self.phase = Phase::AwaitingHeaders;
        self.head_len = 0;
        self.content_type = DEFAULT_CONTENT_TYPE.to_string();
        self.message.clear();
        self.chunk_fault = false;
    }
}

struct HeadFields {
    content_length: usize,
    chunked: bool,
    content_type: String,
}

impl HeadFields {
    fn parse(head: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(head);
        let mut fields = Self {
            content_length: 0,
            chunked: false,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        };
        // Skip the start line; header keys are case-insensitive.
        for line in text.split("\r\n").skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "content-length" => {
                    fields.content_length = value.parse().map_err(|_| {
                        ProxyError::Framing(format!("invalid Content-Length {value:?}"))
                    })?;
                }
                "transfer-encoding" => {
                    if value.to_ascii_lowercase().contains("chunked") {
                        fields.chunked = true;
                    }
                }
                "content-type" => {
                    fields.content_type = value.to_ascii_lowercase();
                }
                _ => {}
            }
        }
        Ok(fields)
    }
}

enum ChunkProgress {
    Done { consumed: usize, body: Vec<u8> },
    Incomplete,
    Malformed(String),
}

/// Walks `size\r\n<bytes>\r\n` frames until the zero-size terminator.
fn decode_chunked(data: &[u8]) -> ChunkProgress {
    let mut pos = 0;
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find_subsequence(&data[pos..], b"\r\n").map(|i| pos + i) else {
            return ChunkProgress::Incomplete;
        };
        let token = String::from_utf8_lossy(&data[pos..line_end]).trim().to_string();
        let Ok(size) = usize::from_str_radix(&token, 16) else {
            return ChunkProgress::Malformed(token);
        };
        pos = line_end + 2;
        if data.len() < pos + size + 2 {
            return ChunkProgress::Incomplete;
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
        if size == 0 {
            return ChunkProgress::Done {
                consumed: pos,
                body,
            };
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// True for content types whose bodies are safe to decode as text.
pub fn is_text_content_type(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("xml")
        || content_type.contains("javascript")
        || content_type.contains("html")
        || content_type.contains("x-www-form-urlencoded")
}

/// Decodes bytes as UTF-8, falling back to a lossless single-byte mapping
/// so that no byte sequence is ever un-loggable.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
