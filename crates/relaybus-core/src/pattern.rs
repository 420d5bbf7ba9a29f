//! Glob pattern compilation shared by the router and pub/sub.
//!
//! Supported syntax:
//! - `*` matches any sequence (including empty)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]` match one character from the class; `[!x]` / `[^x]` negate
//!
//! Every other character matches literally. The compiled regex is anchored
//! at both ends, so `svc.*` matches `svc.auth` but not `xsvc.auth`.

use regex::Regex;
use relaybus_types::error::BusError;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Whether `pattern` contains glob metacharacters.
    pub fn is_glob(pattern: &str) -> bool {
        pattern.contains(['*', '?', '['])
    }

    /// Compile a glob pattern into an anchored matcher.
    pub fn compile(pattern: &str) -> Result<Self, BusError> {
        let source = glob_to_regex(pattern)?;
        let regex = Regex::new(&source).map_err(|e| invalid(pattern, e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// The original glob text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn invalid(pattern: &str, reason: impl Into<String>) -> BusError {
    BusError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
}

/// Translate glob syntax into an anchored regex source string.
fn glob_to_regex(pattern: &str) -> Result<String, BusError> {
    if pattern.is_empty() {
        return Err(invalid(pattern, "pattern cannot be empty"));
    }

    let mut out = String::with_capacity(pattern.len() * 2 + 6);
    // Wildcards cover every character, newlines included.
    out.push_str("(?s)^");

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }

                let mut members = 0usize;
                let mut closed = false;
                for member in chars.by_ref() {
                    match member {
                        // A leading ']' is a literal member, as in POSIX globs.
                        ']' if members > 0 => {
                            closed = true;
                            break;
                        }
                        '-' => out.push('-'),
                        '\\' | '[' | ']' | '^' | '&' | '~' => {
                            out.push('\\');
                            out.push(member);
                        }
                        other => out.push(other),
                    }
                    members += 1;
                }

                if !closed {
                    return Err(invalid(pattern, "unterminated character class"));
                }
                out.push(']');
            }
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }

    out.push('$');
    Ok(out)
}
