//! Frame extraction for the Agent Protocol's stdio transport.
//!
//! The primary framing is one JSON value per `\n`-terminated line. Some
//! JSON-RPC peers (notably the memory MCP child) speak LSP-style
//! `Content-Length` headers instead; the reader auto-detects by peeking at
//! the first non-whitespace byte (`{` or `[` means newline mode).

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameMode {
    Newline,
    Header,
}

#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    mode: Option<FrameMode>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            mode: None,
        }
    }

    /// Next complete frame, or `None` at end of stream. Partial tails stay
    /// buffered across calls.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(frame) = self.extract_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                // A newline-mode tail without a trailing \n is still a frame.
                if self.mode == Some(FrameMode::Newline) && !self.buffer.is_empty() {
                    let tail = String::from_utf8_lossy(&self.buffer).trim().to_string();
                    self.buffer.clear();
                    if !tail.is_empty() {
                        return Ok(Some(tail));
                    }
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn extract_frame(&mut self) -> std::io::Result<Option<String>> {
        if self.mode.is_none() {
            self.mode = detect_mode(&self.buffer);
        }
        match self.mode {
            Some(FrameMode::Newline) => Ok(self.extract_line()),
            Some(FrameMode::Header) => self.extract_header_frame(),
            None => Ok(None),
        }
    }

    fn extract_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|byte| *byte == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
    }

    fn extract_header_frame(&mut self) -> std::io::Result<Option<String>> {
        let Some(header_end) = find_subslice(&self.buffer, b"\r\n\r\n") else {
            return Ok(None);
        };
        let header = String::from_utf8_lossy(&self.buffer[..header_end]).to_string();
        let content_length = header
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "framing header without Content-Length",
                )
            })?;

        let body_start = header_end + 4;
        if self.buffer.len() < body_start + content_length {
            return Ok(None);
        }
        let frame: Vec<u8> = self
            .buffer
            .drain(..body_start + content_length)
            .skip(body_start)
            .collect();
        Ok(Some(String::from_utf8_lossy(&frame).to_string()))
    }
}

fn detect_mode(buffer: &[u8]) -> Option<FrameMode> {
    let first = buffer.iter().find(|byte| !byte.is_ascii_whitespace())?;
    if matches!(first, b'{' | b'[') {
        Some(FrameMode::Newline)
    } else {
        Some(FrameMode::Header)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
