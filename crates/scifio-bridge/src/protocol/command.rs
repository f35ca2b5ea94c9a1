//! Command lines sent to the worker and classification of its replies.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use crate::error::{BridgeError, Result};

pub const READY_TOKEN: &str = "ready";
pub const ACK_TOKEN: &str = "done";
pub const BYTES_TOKEN: &str = "bytes";
pub const DEFAULT_ERROR_MARKER: &str = "ERROR:";

/// One request: a verb followed by whitespace-free argument tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn new(verb: &str) -> Self {
        Self {
            tokens: vec![verb.to_string()],
        }
    }

    /// Append an atom (number, order string, type code...).
    pub fn arg(mut self, token: impl fmt::Display) -> Self {
        let token = token.to_string();
        debug_assert!(
            !token.is_empty() && !token.contains(char::is_whitespace),
            "command token {token:?} would break framing"
        );
        self.tokens.push(token);
        self
    }

    pub fn args<I, T>(self, tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        tokens.into_iter().fold(self, |cmd, t| cmd.arg(t))
    }

    /// Append a file path, percent-encoded so it is a single token.
    pub fn path(self, path: &Path) -> Self {
        self.arg(encode_token(&path.to_string_lossy()))
    }

    pub fn verb(&self) -> &str {
        &self.tokens[0]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

pub fn encode_token(raw: &str) -> Cow<'_, str> {
    urlencoding::encode(raw)
}

pub fn decode_token(token: &str) -> Result<String> {
    urlencoding::decode(token)
        .map(Cow::into_owned)
        .map_err(|e| BridgeError::desync(format!("bad percent-encoding in '{token}': {e}")))
}

/// Prefix the worker puts in front of failure messages.
///
/// Passed explicitly to every protocol instance, so two bridges may use
/// different conventions side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMarker(String);

impl ErrorMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The diagnostic text if `line` carries the marker.
    pub fn strip<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.strip_prefix(self.0.as_str()).map(str::trim_start)
    }
}

impl Default for ErrorMarker {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_MARKER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    /// `done`: the exchange is complete.
    Ack,
    /// Marker-prefixed failure, marker removed.
    Error(String),
    /// `bytes <n>`: a raw payload of `n` bytes follows.
    BinaryLength(usize),
    /// Anything else; interpreted by the exchange in progress.
    Metadata(String),
}

impl ResponseLine {
    pub fn classify(line: &str, marker: &ErrorMarker) -> Result<Self> {
        if let Some(message) = marker.strip(line) {
            return Ok(Self::Error(message.to_string()));
        }

        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(ACK_TOKEN), None, None) => Ok(Self::Ack),
            (Some(BYTES_TOKEN), Some(len), None) => len
                .parse()
                .map(Self::BinaryLength)
                .map_err(|_| BridgeError::desync(format!("bad payload length in '{line}'"))),
            (Some(BYTES_TOKEN), _, _) => {
                Err(BridgeError::desync(format!("malformed length line '{line}'")))
            }
            _ => Ok(Self::Metadata(line.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn command_lines_render_as_one_line() {
        let cmd = CommandLine::new("read").args([0u64, 4, 0, 3]);
        assert_eq!(cmd.verb(), "read");
        insta::assert_snapshot!(cmd.to_string(), @"read 0 4 0 3");
    }

    #[test]
    fn paths_become_single_tokens() {
        let cmd = CommandLine::new("describe").path(&PathBuf::from("/data/my scan\n1.lif"));
        assert_eq!(cmd.tokens().len(), 2);
        insta::assert_snapshot!(cmd.to_string(), @"describe %2Fdata%2Fmy%20scan%0A1.lif");
        assert_eq!(decode_token(&cmd.tokens()[1]).unwrap(), "/data/my scan\n1.lif");
    }

    #[test]
    fn classifies_responses() {
        let marker = ErrorMarker::default();
        assert_eq!(ResponseLine::classify("done", &marker).unwrap(), ResponseLine::Ack);
        assert_eq!(
            ResponseLine::classify("bytes 1024", &marker).unwrap(),
            ResponseLine::BinaryLength(1024)
        );
        assert_eq!(
            ResponseLine::classify("X 4 1.0", &marker).unwrap(),
            ResponseLine::Metadata("X 4 1.0".to_string())
        );
        assert_eq!(
            ResponseLine::classify("ERROR: java.io.FileNotFoundException: a.tif", &marker).unwrap(),
            ResponseLine::Error("java.io.FileNotFoundException: a.tif".to_string())
        );
    }

    #[test]
    fn bad_length_line_is_desync() {
        let marker = ErrorMarker::default();
        for line in ["bytes many", "bytes -1", "bytes 1 2", "bytes"] {
            let err = ResponseLine::classify(line, &marker).unwrap_err();
            assert!(matches!(err, BridgeError::ProtocolDesync(_)), "{line}");
        }
    }

    #[test]
    fn marker_is_per_instance() {
        let custom = ErrorMarker::new("!!");
        assert_eq!(
            ResponseLine::classify("!! boom", &custom).unwrap(),
            ResponseLine::Error("boom".to_string())
        );
        assert_eq!(
            ResponseLine::classify("ERROR: boom", &custom).unwrap(),
            ResponseLine::Metadata("ERROR: boom".to_string())
        );
    }
}
