use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// Boundary used for the locally served stream.
pub const STREAM_BOUNDARY: &str = "frame";

const HEADER_END: &[u8] = b"\r\n\r\n";
/// Parts larger than this are treated as garbage and dropped.
const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Parse state for an MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary delimiter `--<boundary>`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Part declared a Content-Length; waiting for that many bytes.
    CollectingSized(usize),
    /// No length; collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental parser that splits a `multipart/x-mixed-replace` body into
/// JPEG payloads. Feed it chunks as they arrive off the wire.
pub struct MjpegParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the next delimiter.
    scan_from: usize,
}

impl MjpegParser {
    /// `boundary` is the value of the Content-Type `boundary` parameter.
    /// Cameras disagree on whether the leading `--` belongs to it, so it is
    /// accepted either way.
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim().trim_matches('"');
        let boundary = boundary.strip_prefix("--").unwrap_or(boundary);
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Append a chunk and return every JPEG payload it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        let keep = self.delimiter.len();
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let headers = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = match content_length(&headers[..pos]) {
                            Some(len) if len <= MAX_PART_SIZE => ParseState::CollectingSized(len),
                            _ => ParseState::CollectingJpeg,
                        };
                    } else {
                        if self.buffer.len() > MAX_PART_SIZE {
                            self.reset("part headers");
                        }
                        break;
                    }
                }
                ParseState::CollectingSized(len) => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let jpeg = self.buffer.split_to(len).freeze();
                    if !jpeg.is_empty() {
                        frames.push(jpeg);
                    }
                    self.state = ParseState::SeekingBoundary;
                }
                ParseState::CollectingJpeg => {
                    let found =
                        find_subsequence(&self.buffer[self.scan_from..], &self.delimiter);
                    if let Some(pos) = found {
                        let body_end = self.scan_from + pos;
                        let jpeg = self.buffer.split_to(body_end).freeze();
                        let _ = self.buffer.split_to(self.delimiter.len());
                        let jpeg = strip_trailing_crlf(jpeg);
                        if !jpeg.is_empty() {
                            frames.push(jpeg);
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        if self.buffer.len() > MAX_PART_SIZE {
                            self.reset("part body");
                            break;
                        }
                        self.scan_from = self.buffer.len().saturating_sub(self.delimiter.len());
                        break;
                    }
                }
            }
        }

        frames
    }

    /// Flush a trailing part that was never closed by a boundary, e.g. the
    /// last frame before the upstream hung up.
    pub fn finish(&mut self) -> Option<Bytes> {
        if !matches!(self.state, ParseState::CollectingJpeg) {
            return None;
        }
        let jpeg = strip_trailing_crlf(self.buffer.split().freeze());
        self.state = ParseState::SeekingBoundary;
        self.scan_from = 0;
        (!jpeg.is_empty()).then_some(jpeg)
    }

    fn reset(&mut self, what: &str) {
        warn!(
            buffered = self.buffer.len(),
            "MJPEG {what} exceeded {MAX_PART_SIZE} bytes, resynchronising"
        );
        self.buffer.clear();
        self.scan_from = 0;
        self.state = ParseState::SeekingBoundary;
    }
}

/// Extract the `boundary` parameter from a multipart Content-Type header.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Content-Type header value for the locally served stream.
pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}")
}

/// Format one part of the served stream: delimiter, part headers, JPEG bytes
/// and the trailing CRLF.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let headers = std::str::from_utf8(headers).ok()?;
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn strip_trailing_crlf(data: Bytes) -> Bytes {
    if data.ends_with(b"\r\n") {
        data.slice(..data.len() - 2)
    } else {
        data
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Flask-style part: no Content-Length, body terminated by the next boundary.
    fn unsized_part(body: &[u8]) -> Vec<u8> {
        let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(body);
        part.extend_from_slice(b"\r\n");
        part
    }

    #[test]
    fn parses_unsized_parts_on_next_boundary() {
        let mut parser = MjpegParser::new("frame");
        let mut stream = unsized_part(b"\xFF\xD8one\xFF\xD9");
        stream.extend(unsized_part(b"\xFF\xD8two\xFF\xD9"));

        let frames = parser.push(&stream);
        // The second part is only complete once another boundary arrives.
        assert_eq!(frames, vec![Bytes::from_static(b"\xFF\xD8one\xFF\xD9")]);
        assert_eq!(
            parser.finish(),
            Some(Bytes::from_static(b"\xFF\xD8two\xFF\xD9"))
        );
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn sized_parts_are_emitted_immediately() {
        let mut parser = MjpegParser::new(STREAM_BOUNDARY);
        let mut stream = encode_part(b"first").to_vec();
        stream.extend_from_slice(&encode_part(b"second"));

        let frames = parser.push(&stream);
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn survives_byte_at_a_time_delivery() {
        let mut parser = MjpegParser::new("frame");
        let mut stream = Vec::new();
        for body in [&b"aaaa"[..], &b"bbbbbbbb"[..], &b"cc"[..]] {
            stream.extend(unsized_part(body));
        }
        stream.extend_from_slice(&encode_part(b"sized"));

        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(parser.push(std::slice::from_ref(byte)));
        }
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"aaaa"),
                Bytes::from_static(b"bbbbbbbb"),
                Bytes::from_static(b"cc"),
                Bytes::from_static(b"sized"),
            ]
        );
    }

    #[test]
    fn accepts_boundary_declared_with_dashes() {
        let mut parser = MjpegParser::new("--myboundary");
        let stream = b"preamble\r\n--myboundary\r\nContent-Length: 3\r\n\r\nabc\r\n--myboundary\r\n";
        assert_eq!(parser.push(stream), vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn part_without_headers() {
        let mut parser = MjpegParser::new("frame");
        let frames = parser.push(b"--frame\r\n\r\njpeg\r\n--frame\r\n");
        assert_eq!(frames, vec![Bytes::from_static(b"jpeg")]);
    }

    #[test]
    fn boundary_param_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;Boundary=\"--cam\"").as_deref(),
            Some("--cam")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary="),
            None
        );
    }

    #[test]
    fn encoded_part_layout() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
        assert_eq!(
            stream_content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }
}
