/// Incremental UTF-8 decoder for pipe output.
///
/// Reads from a pipe split multi-byte characters at arbitrary points, so a
/// trailing incomplete sequence is held back until the next chunk arrives.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    buf: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return everything that now decodes. Invalid bytes
    /// become U+FFFD; an incomplete trailing sequence stays buffered.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.buf.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.buf.len());
        let mut consumed = 0;

        while consumed < self.buf.len() {
            let rest = &self.buf[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.buf.len();
                }
                Err(e) => {
                    let (valid, _) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    consumed += valid.len();
                    let Some(bad) = e.error_len() else {
                        break;
                    };
                    out.push(char::REPLACEMENT_CHARACTER);
                    consumed += bad;
                }
            }
        }

        self.buf.drain(..consumed);
        out
    }

    /// Flush at end of stream. A dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.buf.is_empty() {
            return String::new();
        }
        self.buf.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_clean_ascii() {
        let mut dec = Utf8StreamDecoder::new();
        assert_eq!(dec.decode(b"print(1)\n"), "print(1)\n");
    }

    #[test]
    fn decode_3byte_split_2_1() {
        let mut dec = Utf8StreamDecoder::new();
        let bytes = "─".as_bytes();

        assert_eq!(dec.decode(&bytes[..2]), "");
        assert_eq!(dec.decode(&bytes[2..]), "─");
    }

    #[test]
    fn decode_4byte_split_1_1_1_1() {
        let mut dec = Utf8StreamDecoder::new();
        let bytes = "🦀".as_bytes();

        assert_eq!(dec.decode(&bytes[..1]), "");
        assert_eq!(dec.decode(&bytes[1..2]), "");
        assert_eq!(dec.decode(&bytes[2..3]), "");
        assert_eq!(dec.decode(&bytes[3..4]), "🦀");
    }

    #[test]
    fn decode_ascii_around_split() {
        let mut dec = Utf8StreamDecoder::new();
        let bytes = "abc─def".as_bytes();

        assert_eq!(dec.decode(&bytes[..4]), "abc");
        assert_eq!(dec.decode(&bytes[4..]), "─def");
    }

    #[test]
    fn invalid_bytes_become_replacement() {
        let mut dec = Utf8StreamDecoder::new();
        assert_eq!(dec.decode(b"ok\xFFok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn finish_flushes_dangling_sequence() {
        let mut dec = Utf8StreamDecoder::new();
        assert_eq!(dec.decode(&"🦀".as_bytes()[..2]), "");
        assert_eq!(dec.finish(), "\u{FFFD}");
        assert_eq!(dec.finish(), "");
    }
}
