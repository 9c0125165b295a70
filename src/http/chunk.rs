//! Chunked transfer-coding.
//!
//! The decoder is incremental: it consumes whatever part of the input it
//! can and remembers where it stopped, so the connection can feed it
//! straight from the receive buffer as bytes arrive.

use crate::http::parser::ParseError;

/// Terminating zero-size chunk with an empty trailer
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest chunk-size or trailer line accepted
const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting a `hex[;ext]\r\n` size line
    Size,
    /// Inside chunk data with this many bytes left
    Data(u64),
    /// Expecting the CRLF after chunk data
    DataEnd,
    /// Reading trailer fields until an empty line
    Trailer,
    Done,
}

#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// True once the zero-size chunk and trailer have been consumed.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decodes from `input`, appending at most `max` data bytes to `out`.
    ///
    /// Returns the number of input bytes consumed. Stops early when the
    /// input ends mid-line, `max` is reached, or the body is complete.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>, max: usize) -> Result<usize, ParseError> {
        let mut pos = 0;
        let mut produced = 0;
        loop {
            let rest = &input[pos..];
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = find_line(rest)? else { break };
                    let size = parse_size_line(&rest[..eol])?;
                    pos += eol + 2;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let n = (remaining.min(usize::MAX as u64) as usize)
                        .min(rest.len())
                        .min(max - produced);
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&rest[..n]);
                    pos += n;
                    produced += n;
                    self.state = if remaining == n as u64 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - n as u64)
                    };
                }
                ChunkState::DataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(eol) = find_line(rest)? else { break };
                    pos += eol + 2;
                    if eol == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }
        Ok(pos)
    }
}

/// Offset of the next CRLF, or `None` if more input is needed.
fn find_line(input: &[u8]) -> Result<Option<usize>, ParseError> {
    match input.windows(2).position(|w| w == b"\r\n") {
        Some(eol) if eol > MAX_LINE => Err(ParseError::InvalidChunk),
        Some(eol) => {
            if input[..eol].iter().any(|&c| c == b'\n' || c == b'\r') {
                return Err(ParseError::InvalidChunk);
            }
            Ok(Some(eol))
        }
        None if input.len() > MAX_LINE => Err(ParseError::InvalidChunk),
        None => Ok(None),
    }
}

fn parse_size_line(line: &[u8]) -> Result<u64, ParseError> {
    let end = line.iter().position(|&c| c == b';').unwrap_or(line.len());
    let digits = &line[..end];
    if digits.is_empty() || digits.len() > 16 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunk);
    }
    let digits = std::str::from_utf8(digits).map_err(|_| ParseError::InvalidChunk)?;
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidChunk)
}

/// Frames one block of data as a chunk. Empty blocks are skipped, since a
/// zero-size chunk would end the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}
