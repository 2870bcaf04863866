//! Small HTTP message parser.
//!
//! Covers exactly what SSDP-style service discovery needs: one request or
//! status line followed by headers. Header names are case-insensitive,
//! folded continuation lines are appended to the previous value, and the
//! token character set follows rfc7230.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Valid characters of an HTTP token per rfc7230.
fn is_token_char(c: u8) -> bool {
  c.is_ascii_alphanumeric()
    || matches!(
      c,
      b'!'
        | b'#'
        | b'$'
        | b'%'
        | b'&'
        | b'\''
        | b'*'
        | b'+'
        | b'-'
        | b'.'
        | b'^'
        | b'_'
        | b'`'
        | b'|'
        | b'~'
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartLine {
  Request { method: String, url: String, proto: String },
  Status { proto: String, code: u16, reason: String },
}

/// Parsed HTTP-style message head.
#[derive(Debug, Clone)]
pub struct HttpParser {
  start: StartLine,
  headers: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
  StartLine,
  Headers,
  Done,
}

impl HttpParser {
  /// Parses a complete message head (everything up to the blank line).
  pub fn parse(input: &str) -> Result<HttpParser> {
    let mut state = State::StartLine;
    let mut start = None;
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut last_header: Option<String> = None;

    for raw_line in input.split('\n') {
      let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
      match state {
        State::StartLine => {
          if line.is_empty() {
            // Tolerate leading empty lines.
            continue;
          }
          start = Some(Self::parse_start_line(line)?);
          state = State::Headers;
        }
        State::Headers => {
          if line.is_empty() {
            state = State::Done;
            continue;
          }
          if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation belongs to the previous header.
            let name = last_header.clone().ok_or_else(|| {
              Error::Parse("continuation before any header".into())
            })?;
            let value = headers.get_mut(&name).expect("header exists");
            value.push(' ');
            value.push_str(line.trim());
            continue;
          }
          let (name, value) = Self::parse_header(line)?;
          last_header = Some(name.clone());
          match headers.get_mut(&name) {
            Some(existing) => {
              existing.push(',');
              existing.push_str(&value);
            }
            None => {
              headers.insert(name, value);
            }
          }
        }
        State::Done => break,
      }
    }

    let start = start.ok_or_else(|| Error::Parse("empty message".into()))?;
    Ok(HttpParser { start, headers })
  }

  fn parse_start_line(line: &str) -> Result<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let first = parts
      .next()
      .ok_or_else(|| Error::Parse("empty start line".into()))?;
    if let Some(version) = first.strip_prefix("HTTP/") {
      // Status line: HTTP/1.1 200 OK
      let code = parts
        .next()
        .ok_or_else(|| Error::Parse("status line without code".into()))?;
      let code: u16 = code
        .parse()
        .map_err(|_| Error::Parse(format!("bad status code {code:?}")))?;
      let reason = parts.next().unwrap_or("").to_string();
      return Ok(StartLine::Status {
        proto: version.to_string(),
        code,
        reason,
      });
    }
    // Request line: NOTIFY * HTTP/1.1
    if !first.bytes().all(is_token_char) {
      return Err(Error::Parse(format!("bad method {first:?}")));
    }
    let url = parts
      .next()
      .ok_or_else(|| Error::Parse("request line without url".into()))?;
    let proto = parts
      .next()
      .ok_or_else(|| Error::Parse("request line without version".into()))?;
    let proto = proto
      .strip_prefix("HTTP/")
      .ok_or_else(|| Error::Parse(format!("bad protocol {proto:?}")))?;
    Ok(StartLine::Request {
      method: first.to_string(),
      url: url.to_string(),
      proto: proto.to_string(),
    })
  }

  fn parse_header(line: &str) -> Result<(String, String)> {
    let colon = line
      .find(':')
      .ok_or_else(|| Error::Parse(format!("header without colon: {line:?}")))?;
    let name = &line[..colon];
    if name.is_empty() || !name.bytes().all(is_token_char) {
      return Err(Error::Parse(format!("bad header name {name:?}")));
    }
    let value = line[colon + 1..].trim();
    Ok((name.to_ascii_lowercase(), value.to_string()))
  }

  pub fn is_request(&self) -> bool {
    matches!(self.start, StartLine::Request { .. })
  }

  pub fn method(&self) -> Option<&str> {
    match &self.start {
      StartLine::Request { method, .. } => Some(method),
      StartLine::Status { .. } => None,
    }
  }

  pub fn url(&self) -> Option<&str> {
    match &self.start {
      StartLine::Request { url, .. } => Some(url),
      StartLine::Status { .. } => None,
    }
  }

  pub fn status_code(&self) -> Option<u16> {
    match &self.start {
      StartLine::Status { code, .. } => Some(*code),
      StartLine::Request { .. } => None,
    }
  }

  /// Header lookup, case-insensitive. Empty string when absent.
  pub fn header_value(&self, name: &str) -> &str {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
      .unwrap_or("")
  }

  pub fn header_count(&self) -> usize {
    self.headers.len()
  }
}
