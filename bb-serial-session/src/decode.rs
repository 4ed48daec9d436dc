/// Incremental UTF-8 decoder for chunked serial input.
///
/// A multi-byte character split across two reads is emitted once, when the second chunk arrives.
/// Invalid sequences become U+FFFD. An incomplete sequence left at the end of the stream is
/// flushed as U+FFFD by [`finish`](Self::finish).
#[derive(Debug, Default, Clone)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(x) => {
                    out.push_str(x);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));

                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending.extend_from_slice(tail);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered. Call once the stream has ended.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Bytes of an incomplete character waiting for the next chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"ets Jun  8 2016\r\n"), "ets Jun  8 2016\r\n");
        assert_eq!(d.pending(), 0);
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn split_character() {
        // U+00B0 DEGREE SIGN is 0xC2 0xB0
        let mut d = Utf8StreamDecoder::new();

        assert_eq!(d.decode(b"21.5\xc2"), "21.5");
        assert_eq!(d.pending(), 1);
        assert_eq!(d.decode(b"\xb0C"), "\u{b0}C");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn split_four_bytes() {
        let bytes = "🚀".as_bytes();
        let mut d = Utf8StreamDecoder::new();

        let mut out = String::new();
        for b in bytes {
            out.push_str(&d.decode(std::slice::from_ref(b)));
        }

        assert_eq!(out, "🚀");
    }

    #[test]
    fn invalid_bytes() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"a\xffb\xc2c"), "a\u{fffd}b\u{fffd}c");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn truncated_at_end() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"ok\xe2\x82"), "ok");
        assert_eq!(d.finish(), "\u{fffd}");
        assert_eq!(d.finish(), "");
    }
}
