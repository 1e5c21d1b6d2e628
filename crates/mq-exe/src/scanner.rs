//! Static scan of script bodies for `register_value(...)` calls
//!
//! The scan is textual: quoted arguments of every call are collected before
//! the script runs so that the engine can subscribe ahead of time. Comments
//! are not recognised, so a commented-out call still counts.

use mq_core::ValueRef;
use regex::Regex;

use crate::error::{ScanError, ScanResult};

pub struct ScriptScanner {
    call: Regex,
    quoted: Regex,
}

/// Byte offset of the parenthesis closing the one opened just before `start`
fn closing_paren(body: &str, start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in body[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

impl ScriptScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            call: Regex::new(r"\bregister_value\s*\(")?,
            quoted: Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'"#)?,
        })
    }

    /// Every distinct value reference passed to `register_value` as a literal
    pub fn scan(&self, body: &str) -> ScanResult<Vec<ValueRef>> {
        let mut found: Vec<ValueRef> = Vec::new();

        for call in self.call.find_iter(body) {
            let close = closing_paren(body, call.end()).ok_or(ScanError::Unterminated {
                offset: call.start(),
            })?;
            let arguments = &body[call.end()..close];

            for quoted in self.quoted.captures_iter(arguments) {
                let Some(text) = quoted.get(1).or_else(|| quoted.get(2)) else {
                    continue;
                };
                let reference: ValueRef = text.as_str().parse().map_err(|source| {
                    ScanError::InvalidReference {
                        reference: text.as_str().to_string(),
                        source,
                    }
                })?;
                if !found.contains(&reference) {
                    found.push(reference);
                }
            }
        }
        Ok(found)
    }
}
