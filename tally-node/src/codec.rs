//! Stream framing for both wire formats.
//!
//! The line format is newline delimited. The legacy format has no terminator,
//! so tokens such as `COUNT:3COUNT:4` are split after the digits that follow
//! each colon. Digits running to the end of the buffered bytes are taken as
//! the whole number, since waiting for more could hold the latest broadcast
//! back indefinitely. A number split across two reads is therefore decoded
//! as two tokens: `COUNT:12` then a malformed `3COUNT:4`, which the caller
//! discards. The line format has no such limitation.

use bytes::{Buf, BufMut, BytesMut};
use tally_common::{Message, WireFormat, MAX_MESSAGE_LEN};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest run of bytes searched for a tag separator before giving up
const MAX_TAG_LEN: usize = 64;

/// Framing for one connection, chosen by the configured wire format
#[derive(Debug)]
pub enum CountCodec {
    Line(LinesCodec),
    Legacy(LegacyCodec),
}

impl CountCodec {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Line => CountCodec::Line(LinesCodec::new_with_max_length(MAX_MESSAGE_LEN)),
            WireFormat::Legacy => CountCodec::Legacy(LegacyCodec),
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            CountCodec::Line(_) => WireFormat::Line,
            CountCodec::Legacy(_) => WireFormat::Legacy,
        }
    }
}

impl Decoder for CountCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        match self {
            CountCodec::Line(codec) => codec.decode(src),
            CountCodec::Legacy(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        match self {
            CountCodec::Line(codec) => codec.decode_eof(src),
            CountCodec::Legacy(codec) => codec.decode_eof(src),
        }
    }
}

impl Encoder<Message> for CountCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        let text = item.encode(self.format());
        dst.reserve(text.len());
        dst.put_slice(text.as_bytes());
        Ok(())
    }
}

/// Splits unterminated `TAG:<n>` tokens out of a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyCodec;

impl LegacyCodec {
    /// Index one past the end of the token starting at `src[0]`, or `None`
    /// when more bytes are needed to know where it ends.
    fn token_end(src: &[u8]) -> Option<usize> {
        let search = &src[..src.len().min(MAX_TAG_LEN)];
        let Some(sep) = search.iter().position(|b| *b == b':' || *b == b'\n') else {
            // No separator in sight; once the tag window is full treat the
            // bytes as one garbage token so the caller can discard them.
            return (src.len() >= MAX_TAG_LEN).then_some(MAX_TAG_LEN);
        };

        if src[sep] == b'\n' {
            return Some(sep + 1);
        }

        let mut end = sep + 1;
        if src.get(end) == Some(&b'-') {
            end += 1;
        }
        while end < src.len() && src[end].is_ascii_digit() {
            end += 1;
        }

        if end == src.len() && !src[end - 1].is_ascii_digit() {
            // Tag without its number yet
            return None;
        }
        Some(end)
    }
}

impl Decoder for LegacyCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        let leading = src
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        src.advance(leading);

        if src.is_empty() {
            return Ok(None);
        }
        if src.len() > MAX_MESSAGE_LEN * 2 && Self::token_end(src).is_none() {
            return Err(LinesCodecError::MaxLineLengthExceeded);
        }

        Ok(Self::token_end(src).map(|end| {
            let token = src.split_to(end);
            String::from_utf8_lossy(&token).trim().to_string()
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        if let Some(token) = self.decode(src)? {
            return Ok(Some(token));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(String::from_utf8_lossy(&rest).trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut CountCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).expect("decode") {
            out.push(item);
        }
        while let Some(item) = codec.decode_eof(&mut buf).expect("decode_eof") {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_line_codec_splits_lines() {
        let mut codec = CountCodec::new(WireFormat::Line);
        assert_eq!(drain(&mut codec, b"0\n1\n2\n"), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_legacy_codec_splits_concatenated_tokens() {
        let mut codec = CountCodec::new(WireFormat::Legacy);
        assert_eq!(
            drain(&mut codec, b"COUNT:3ACCEPTED:4INVALID_COUNT:-1"),
            vec!["COUNT:3", "ACCEPTED:4", "INVALID_COUNT:-1"]
        );
    }

    #[test]
    fn test_legacy_codec_waits_for_digits_after_tag() {
        let mut codec = LegacyCodec;
        let mut buf = BytesMut::from(&b"ACCEPTED:-"[..]);
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);

        buf.extend_from_slice(b"12COUNT:1");
        assert_eq!(
            codec.decode(&mut buf).expect("decode").as_deref(),
            Some("ACCEPTED:-12")
        );
        assert_eq!(
            codec.decode(&mut buf).expect("decode").as_deref(),
            Some("COUNT:1")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_legacy_codec_cannot_rejoin_number_split_across_reads() {
        let mut codec = LegacyCodec;
        let mut buf = BytesMut::from(&b"COUNT:12"[..]);
        assert_eq!(
            codec.decode(&mut buf).expect("decode").as_deref(),
            Some("COUNT:12")
        );

        buf.extend_from_slice(b"3COUNT:4");
        let tail = codec.decode(&mut buf).expect("decode").expect("token");
        assert_eq!(tail, "3COUNT:4");
        assert!(Message::parse(&tail).is_err());
    }

    #[test]
    fn test_legacy_codec_surfaces_garbage() {
        let mut codec = CountCodec::new(WireFormat::Legacy);
        let items = drain(&mut codec, b"hello\nCOUNT:2");
        assert_eq!(items, vec!["hello", "COUNT:2"]);
        assert!(Message::parse(&items[0]).is_err());
    }

    #[test]
    fn test_encoder_uses_configured_format() {
        let mut line = CountCodec::new(WireFormat::Line);
        let mut legacy = CountCodec::new(WireFormat::Legacy);
        let mut buf = BytesMut::new();

        line.encode(Message::Count(5), &mut buf).expect("encode");
        legacy.encode(Message::Count(6), &mut buf).expect("encode");
        assert_eq!(&buf[..], b"5\nCOUNT:6");
    }
}
