//! Reply and event model for the control protocol
//!
//! A command produces exactly one [`Reply`]: every `-`/`+` line plus the
//! final ` ` line, in arrival order. Asynchronous `6xx` notifications are
//! grouped the same way and surfaced as [`Event`]s.

use crate::error::{Error, Result};

/// One reply line: the text after the status/separator, plus the raw data
/// block when the line opened one (`+` separator).
#[derive(Debug, Clone)]
pub struct ReplyLine {
    pub status: u16,
    pub text: String,
    pub data: Option<Vec<String>>,
}

/// Complete reply to a single command.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Status of the final line.
    pub status: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// 250 is the protocol's blanket success status.
    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    /// Text of the final line (e.g. the error message on refusal).
    pub fn last_text(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Iterate `key=value` payload lines, skipping the trailing `OK`.
    pub fn kv_lines(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.lines.iter().filter(|l| l.text != "OK").map(|l| {
            match l.text.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (l.text.as_str(), None),
            }
        })
    }

    /// Map a refused command into `err(text)`.
    pub fn require_ok(&self, err: impl FnOnce(String) -> Error) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(err(format!("{} {}", self.status, self.last_text())))
        }
    }
}

/// Asynchronous event pushed by Tor (status `650`).
#[derive(Debug, Clone)]
pub struct Event {
    /// Uppercased first word, e.g. `STATUS_CLIENT` or `HS_DESC`.
    pub keyword: String,
    /// All lines of the notification, first one included.
    pub lines: Vec<String>,
}

/// Split a space-separated argument list honoring `"…"` quoting with
/// backslash escapes, as used throughout control-port replies.
pub fn split_quoted(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;
    let mut seen_any = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                seen_any = true;
            },
            '\\' if in_quotes => {
                if let Some(esc) = chars.next() {
                    cur.push(esc);
                }
            },
            ' ' if !in_quotes => {
                if seen_any || !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                    seen_any = false;
                }
            },
            _ => {
                cur.push(c);
                seen_any = true;
            },
        }
    }
    if seen_any || !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Quote an argument for the wire if it contains whitespace or quotes.
pub fn quote_arg(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '"', '\\']) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Pull `KEY=` arguments out of a tokenized reply line.
pub fn find_arg<'a>(tokens: &'a [String], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .find_map(|t| t.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}
