//! Wire format of the administrative channel.
//!
//! One envelope per line:
//!
//! ```text
//! <kind> <request_id> <inner command>\r\n
//! ```
//!
//! `kind` is `0` for a request and `1` for a response. The inner command is
//! split into `argv` with shell-style quoting so JSON payloads and
//! arguments containing spaces survive the trip.

use crate::request_id::RequestId;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder, LinesCodecError,
};

/// Longest line accepted from a peer.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Reason attached to a rejected `stop_service` while one is pending.
pub const STOP_IN_PROGRESS: &str = "Stop service in progress...";

/// Malformed envelopes and inner commands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty envelope")]
    Empty,

    #[error("Unknown sequence kind: {0}")]
    UnknownKind(String),

    #[error("Invalid request id: {0}")]
    InvalidRequestId(String),

    #[error("Envelope carries no command")]
    MissingCommand,

    #[error("Unbalanced quotes in command")]
    UnbalancedQuotes,

    #[error("Closing quote must be followed by a space")]
    TrailingAfterQuote,

    #[error("Command is not valid UTF-8")]
    InvalidUtf8,
}

/// Whether an envelope is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Request,
    Response,
}

impl SequenceKind {
    pub fn code(&self) -> &'static str {
        match self {
            SequenceKind::Request => "0",
            SequenceKind::Response => "1",
        }
    }

    fn from_code(code: &str) -> Result<Self, ProtocolError> {
        match code {
            "0" => Ok(SequenceKind::Request),
            "1" => Ok(SequenceKind::Response),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

/// One parsed administrative message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: SequenceKind,
    pub id: RequestId,
    pub argv: Vec<String>,
}

impl Envelope {
    pub fn request(id: RequestId, argv: Vec<String>) -> Self {
        Self {
            kind: SequenceKind::Request,
            id,
            argv,
        }
    }

    /// `ok <command>` response echoing `id`.
    pub fn response_ok(id: RequestId, command: &str) -> Self {
        Self {
            kind: SequenceKind::Response,
            id,
            argv: vec!["ok".to_string(), command.to_string()],
        }
    }

    /// `fail <command> <reason>` response echoing `id`.
    pub fn response_fail(id: RequestId, command: &str, reason: &str) -> Self {
        Self {
            kind: SequenceKind::Response,
            id,
            argv: vec!["fail".to_string(), command.to_string(), reason.to_string()],
        }
    }

    /// The command name (`argv[0]`).
    pub fn command(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.argv.get(index).map(String::as_str)
    }

    /// Parse a single line (terminator optional).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut parts = line.splitn(3, ' ');
        let kind = SequenceKind::from_code(parts.next().unwrap_or_default())?;

        let id = parts.next().unwrap_or_default();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidRequestId(id.to_string()));
        }

        let argv = split_args(parts.next().unwrap_or_default())?;
        if argv.is_empty() {
            return Err(ProtocolError::MissingCommand);
        }

        Ok(Self {
            kind,
            id: RequestId::from_wire(id),
            argv,
        })
    }

    /// Render without the line terminator.
    pub fn encode(&self) -> String {
        let inner: Vec<String> = self.argv.iter().map(|a| quote_arg(a)).collect();
        format!("{} {} {}", self.kind.code(), self.id, inner.join(" "))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn is_separator(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r' | b'\t' | b'\0')
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Split a command line into arguments using shell-style quoting.
pub fn split_args(line: &str) -> Result<Vec<String>, ProtocolError> {
    let bytes = line.as_bytes();
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while i < bytes.len() && is_separator(bytes[i]) {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let mut current = Vec::new();
        let mut in_double = false;
        let mut in_single = false;

        loop {
            let c = bytes.get(i).copied();
            if in_double {
                match c {
                    None => return Err(ProtocolError::UnbalancedQuotes),
                    Some(b'\\') if bytes.get(i + 1) == Some(&b'x') => {
                        match (
                            bytes.get(i + 2).copied().and_then(hex_value),
                            bytes.get(i + 3).copied().and_then(hex_value),
                        ) {
                            (Some(hi), Some(lo)) => {
                                current.push(hi * 16 + lo);
                                i += 3;
                            }
                            _ => {
                                current.push(b'x');
                                i += 1;
                            }
                        }
                    }
                    Some(b'\\') if i + 1 < bytes.len() => {
                        i += 1;
                        current.push(match bytes[i] {
                            b'n' => b'\n',
                            b'r' => b'\r',
                            b't' => b'\t',
                            b'b' => 0x08,
                            b'a' => 0x07,
                            other => other,
                        });
                    }
                    Some(b'"') => {
                        if bytes.get(i + 1).is_some_and(|b| !is_separator(*b)) {
                            return Err(ProtocolError::TrailingAfterQuote);
                        }
                        i += 1;
                        break;
                    }
                    Some(other) => current.push(other),
                }
            } else if in_single {
                match c {
                    None => return Err(ProtocolError::UnbalancedQuotes),
                    Some(b'\\') if bytes.get(i + 1) == Some(&b'\'') => {
                        current.push(b'\'');
                        i += 1;
                    }
                    Some(b'\'') => {
                        if bytes.get(i + 1).is_some_and(|b| !is_separator(*b)) {
                            return Err(ProtocolError::TrailingAfterQuote);
                        }
                        i += 1;
                        break;
                    }
                    Some(other) => current.push(other),
                }
            } else {
                match c {
                    None => break,
                    Some(b) if is_separator(b) => break,
                    Some(b'"') => in_double = true,
                    Some(b'\'') => in_single = true,
                    Some(other) => current.push(other),
                }
            }
            i += 1;
        }

        args.push(String::from_utf8(current).map_err(|_| ProtocolError::InvalidUtf8)?);
    }

    Ok(args)
}

/// Quote one argument so [`split_args`] gives it back unchanged.
pub fn quote_arg(arg: &str) -> String {
    let bare = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b'"' | b'\'' | b'\\'));
    if bare {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for ch in arg.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '\u{07}' => quoted.push_str("\\a"),
            '\u{08}' => quoted.push_str("\\b"),
            c if c.is_ascii_control() => quoted.push_str(&format!("\\x{:02x}", c as u8)),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Line codec for the administrative channel: reads `\n` or `\r\n`
/// terminated lines, writes `\r\n`.
///
/// A line that is not UTF-8 decodes to `Err(ProtocolError::InvalidUtf8)`
/// and the stream carries on with the next one. Only transport failures and
/// over-long lines end the stream.
#[derive(Debug)]
pub struct EnvelopeCodec {
    lines: AnyDelimiterCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\r\n".to_vec(), MAX_LINE_LEN),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn into_line(chunk: Bytes) -> Result<String, ProtocolError> {
    let bytes: &[u8] = &chunk;
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn channel_error(err: AnyDelimiterCodecError) -> LinesCodecError {
    match err {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => LinesCodecError::MaxLineLengthExceeded,
        AnyDelimiterCodecError::Io(e) => LinesCodecError::Io(e),
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<String, ProtocolError>;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, LinesCodecError> {
        Ok(self.lines.decode(src).map_err(channel_error)?.map(into_line))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, LinesCodecError> {
        Ok(self.lines.decode_eof(src).map_err(channel_error)?.map(into_line))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        let line = item.encode();
        dst.reserve(line.len() + 2);
        dst.put(line.as_bytes());
        dst.put(&b"\r\n"[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        split_args(line).unwrap()
    }

    #[test]
    fn test_split_plain_words() {
        assert_eq!(args("  activate   now "), vec!["activate", "now"]);
        assert!(args("   ").is_empty());
    }

    #[test]
    fn test_split_quoted_arguments() {
        assert_eq!(
            args(r#"stop_service "hello world" 'single quoted'"#),
            vec!["stop_service", "hello world", "single quoted"]
        );
        assert_eq!(args(r#"x "a\"b\\c\n""#), vec!["x", "a\"b\\c\n"]);
        assert_eq!(args(r#"x "\x41\x42""#), vec!["x", "AB"]);
        assert_eq!(args(r"x 'it\'s'"), vec!["x", "it's"]);
    }

    #[test]
    fn test_split_json_payload() {
        let argv = args(r#"activate '{"license_key": "abc 123"}'"#);
        assert_eq!(argv[1], r#"{"license_key": "abc 123"}"#);
    }

    #[test]
    fn test_split_errors() {
        assert_eq!(split_args(r#"x "open"#), Err(ProtocolError::UnbalancedQuotes));
        assert_eq!(split_args("x 'open"), Err(ProtocolError::UnbalancedQuotes));
        assert_eq!(
            split_args(r#"x "closed"glued"#),
            Err(ProtocolError::TrailingAfterQuote)
        );
    }

    #[test]
    fn test_quote_arg_round_trip() {
        let samples = [
            "plain",
            "with space",
            "",
            "quote\"inside",
            "it's",
            "back\\slash",
            "tab\tand\nnewline",
            "{\"license_key\":\"k\"}",
            "caf\u{e9}",
        ];
        let line = samples.iter().map(|s| quote_arg(s)).collect::<Vec<_>>().join(" ");
        assert_eq!(args(&line), samples);
    }

    #[test]
    fn test_envelope_round_trip_with_spaces() {
        let id = RequestId::from_counter(42);
        let argv = vec![
            "stop_service".to_string(),
            r#"{"license_key": "two words"}"#.to_string(),
        ];
        let envelope = Envelope::request(id.clone(), argv.clone());

        let parsed = Envelope::parse(&envelope.encode()).unwrap();
        assert_eq!(parsed.kind, SequenceKind::Request);
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.argv, argv);
    }

    #[test]
    fn test_parse_response() {
        let parsed =
            Envelope::parse("1 00000000000000ff fail stop_service \"Stop service in progress...\"\r\n")
                .unwrap();
        assert_eq!(parsed.kind, SequenceKind::Response);
        assert_eq!(parsed.id.as_str(), "00000000000000ff");
        assert_eq!(parsed.command(), "fail");
        assert_eq!(parsed.arg(2), Some(STOP_IN_PROGRESS));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Envelope::parse(""), Err(ProtocolError::Empty));
        assert_eq!(
            Envelope::parse("7 00 ping"),
            Err(ProtocolError::UnknownKind("7".to_string()))
        );
        assert_eq!(
            Envelope::parse("0 xyz ping"),
            Err(ProtocolError::InvalidRequestId("xyz".to_string()))
        );
        assert_eq!(Envelope::parse("0 00"), Err(ProtocolError::MissingCommand));
        assert_eq!(Envelope::parse("0 00  "), Err(ProtocolError::MissingCommand));
    }

    #[test]
    fn test_response_builders() {
        let ok = Envelope::response_ok(RequestId::from_wire("0a"), "activate");
        assert_eq!(ok.encode(), "1 0a ok activate");

        let fail = Envelope::response_fail(RequestId::from_wire("0b"), "stop_service", STOP_IN_PROGRESS);
        assert_eq!(fail.encode(), "1 0b fail stop_service \"Stop service in progress...\"");
    }

    #[test]
    fn test_codec_writes_crlf_and_reads_both_terminators() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::request(RequestId::from_counter(1), vec!["ping".into()]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"0 0000000000000001 ping\r\n");

        let mut input = BytesMut::from(&b"0 01 ping\r\n1 02 ok ping\n"[..]);
        assert_eq!(codec.decode(&mut input).unwrap(), Some(Ok("0 01 ping".to_string())));
        assert_eq!(codec.decode(&mut input).unwrap(), Some(Ok("1 02 ok ping".to_string())));
        assert_eq!(codec.decode(&mut input).unwrap(), None);
    }

    #[test]
    fn test_codec_skips_past_non_utf8_line() {
        let mut codec = EnvelopeCodec::new();
        let mut input = BytesMut::from(&b"0 01 activate \xff\xfe\r\n0 02 ping\r\n"[..]);

        assert_eq!(codec.decode(&mut input).unwrap(), Some(Err(ProtocolError::InvalidUtf8)));
        assert_eq!(codec.decode(&mut input).unwrap(), Some(Ok("0 02 ping".to_string())));
        assert_eq!(codec.decode(&mut input).unwrap(), None);
    }

    #[test]
    fn test_codec_rejects_over_long_line() {
        let mut codec = EnvelopeCodec::new();
        let mut input = BytesMut::from(vec![b'a'; MAX_LINE_LEN + 1].as_slice());

        assert!(matches!(
            codec.decode(&mut input),
            Err(LinesCodecError::MaxLineLengthExceeded)
        ));
    }
}
