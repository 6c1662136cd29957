//! Dictionary line protocol spoken to helper subprocesses.
//!
//! A message is a block of `key=value` lines terminated by one empty line.
//! Backslash, newline, and `=` are escaped in both keys and values, so any
//! byte string that is valid UTF-8 survives a round trip.

use std::collections::BTreeMap;

use crate::error::CoreError;

/// An ordered string-to-string dictionary message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dictionary(BTreeMap<String, String>);

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to a wire frame: escaped `key=value` lines plus the
    /// terminating empty line.
    #[must_use]
    pub fn to_frame(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.0 {
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Parse one frame. The terminating empty line is optional here; the
    /// stream reader strips it before handing blocks over.
    pub fn parse_frame(text: &str) -> Result<Self, CoreError> {
        let mut dict = Self::new();
        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            let (key, value) = split_key_value(line)?;
            dict.insert(unescape(key)?, unescape(value)?);
        }
        Ok(dict)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('=') => out.push('='),
            Some(other) => {
                return Err(CoreError::DictionarySyntax(format!(
                    "unknown escape \\{other}"
                )))
            }
            None => {
                return Err(CoreError::DictionarySyntax(
                    "dangling escape at end of line".into(),
                ))
            }
        }
    }
    Ok(out)
}

/// Split a line at its first unescaped `=`.
fn split_key_value(line: &str) -> Result<(&str, &str), CoreError> {
    let bytes = line.as_bytes();
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'=' {
            return Ok((&line[..i], &line[i + 1..]));
        }
    }
    Err(CoreError::DictionarySyntax(
        "line is missing an '=' separator".into(),
    ))
}
