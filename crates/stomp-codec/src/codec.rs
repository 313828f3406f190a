use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StompError;
use crate::frame::{Command, Frame, Packet};

/// Default upper bound for a single frame, header block included.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct StompCodec {
    max_frame_len: usize,
}

impl Default for StompCodec {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl StompCodec {
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    fn check_len(&self, len: usize) -> Result<(), StompError> {
        if len > self.max_frame_len {
            return Err(StompError::FrameTooLarge {
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

/// Locate the blank line that ends the header block.
///
/// Returns the length of the command + header lines and the offset of the
/// first body byte.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut start = 0;
    loop {
        let newline = start + buf[start..].iter().position(|&b| b == b'\n')?;
        let line = &buf[start..newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && start > 0 {
            return Some((start, newline + 1));
        }
        start = newline + 1;
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => return Err(StompError::InvalidEscape(other)),
            None => return Err(StompError::InvalidEscape(' ')),
        }
    }
    Ok(out)
}

fn escape_into(raw: &str, dst: &mut BytesMut) {
    for c in raw.chars() {
        match c {
            '\\' => dst.put_slice(b"\\\\"),
            '\r' => dst.put_slice(b"\\r"),
            '\n' => dst.put_slice(b"\\n"),
            ':' => dst.put_slice(b"\\c"),
            _ => {
                let mut tmp = [0u8; 4];
                dst.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn parse_head(head: &str) -> Result<(Command, Vec<(String, String)>), StompError> {
    let mut lines = head
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));
    let command: Command = lines.next().unwrap_or_default().parse()?;

    let mut headers = Vec::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Packet;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(Packet::Heartbeat));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] == b'\n' {
                    src.advance(2);
                    return Ok(Some(Packet::Heartbeat));
                }
            }
            Some(_) => {}
        }

        let Some((header_len, body_start)) = find_header_end(src) else {
            self.check_len(src.len())?;
            return Ok(None);
        };

        let head = std::str::from_utf8(&src[..header_len]).map_err(|_| StompError::InvalidUtf8)?;
        let (command, headers) = parse_head(head)?;
        let mut frame = Frame {
            command,
            headers,
            body: Default::default(),
        };

        let (body_len, total_len) = match frame.content_length()? {
            Some(len) => {
                self.check_len(len)?;
                let end = body_start
                    .checked_add(len)
                    .filter(|end| *end < usize::MAX)
                    .ok_or(StompError::FrameTooLarge {
                        max: self.max_frame_len,
                    })?;
                if src.len() <= end {
                    self.check_len(end + 1)?;
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(StompError::MissingTerminator);
                }
                (len, end + 1)
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(len) => (len, body_start + len + 1),
                None => {
                    self.check_len(src.len())?;
                    return Ok(None);
                }
            },
        };
        self.check_len(total_len)?;

        src.advance(body_start);
        frame.body = src.split_to(body_len).freeze();
        src.advance(1);

        Ok(Some(Packet::Frame(frame)))
    }
}

impl Encoder<Packet> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Packet::Heartbeat => {
                dst.put_u8(b'\n');
                Ok(())
            }
            Packet::Frame(frame) => <Self as Encoder<Frame>>::encode(self, frame, dst),
        }
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        let escape = frame.command.escapes_headers();
        for (name, value) in &frame.headers {
            if escape {
                escape_into(name, dst);
                dst.put_u8(b':');
                escape_into(value, dst);
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get_header("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);

        self.check_len(dst.len() - start)
    }
}
