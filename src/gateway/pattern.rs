//! Redis-style glob patterns
//!
//! Supports the syntax accepted by `SCAN ... MATCH`:
//! - `*` any sequence, `?` any single character
//! - `[abc]`, `[^abc]`, `[a-z]` character classes
//! - `\x` escapes `x`
//!
//! Patterns are compiled once into an anchored [`Regex`].

use crate::error::ConfigError;
use regex::Regex;

/// Pattern that matches every key
pub const MATCH_ALL: &str = "*";

/// Compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Check a key against the pattern
    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Original glob text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True for the bare `*` pattern
    pub fn matches_all(&self) -> bool {
        self.source == MATCH_ALL
    }
}

fn escape_char(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0u8; 4]))
}

fn translate(pattern: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::from("(?s)^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                // Collapse runs of stars
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&escape_char(escaped)),
                None => out.push_str(&escape_char('\\')),
            },
            '[' => {
                let mut class = String::new();
                let negated = chars.peek() == Some(&'^');
                if negated {
                    chars.next();
                }

                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| invalid("dangling escape in class"))?;
                            class.push_str(&escape_char(escaped));
                        }
                        start => {
                            let mut lookahead = chars.clone();
                            if lookahead.next() == Some('-') {
                                match lookahead.next() {
                                    Some(end) if end != ']' => {
                                        chars.next();
                                        chars.next();
                                        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                                        class.push_str(&escape_char(lo));
                                        class.push('-');
                                        class.push_str(&escape_char(hi));
                                        continue;
                                    }
                                    _ => {}
                                }
                            }
                            class.push_str(&escape_char(start));
                        }
                    }
                }

                if !closed {
                    return Err(invalid("unterminated character class"));
                }
                if class.is_empty() {
                    return Err(invalid("empty character class"));
                }

                out.push('[');
                if negated {
                    out.push('^');
                }
                out.push_str(&class);
                out.push(']');
            }
            literal => out.push_str(&escape_char(literal)),
        }
    }

    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        let p = GlobPattern::new("user:*").unwrap();
        assert!(p.is_match("user:1"));
        assert!(p.is_match("user:"));
        assert!(!p.is_match("session:1"));

        let p = GlobPattern::new("h?llo").unwrap();
        assert!(p.is_match("hello"));
        assert!(p.is_match("hallo"));
        assert!(!p.is_match("hllo"));
    }

    #[test]
    fn test_character_classes() {
        let p = GlobPattern::new("h[ae]llo").unwrap();
        assert!(p.is_match("hello"));
        assert!(p.is_match("hallo"));
        assert!(!p.is_match("hillo"));

        let p = GlobPattern::new("h[^e]llo").unwrap();
        assert!(p.is_match("hallo"));
        assert!(!p.is_match("hello"));

        let p = GlobPattern::new("key[0-9]").unwrap();
        assert!(p.is_match("key7"));
        assert!(!p.is_match("keyx"));

        // Reversed ranges are accepted
        let p = GlobPattern::new("key[9-0]").unwrap();
        assert!(p.is_match("key3"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let p = GlobPattern::new("a.b+c(d)").unwrap();
        assert!(p.is_match("a.b+c(d)"));
        assert!(!p.is_match("axb+c(d)"));

        let p = GlobPattern::new(r"literal\*star").unwrap();
        assert!(p.is_match("literal*star"));
        assert!(!p.is_match("literalXstar"));
    }

    #[test]
    fn test_invalid_classes() {
        assert!(GlobPattern::new("key[abc").is_err());
        assert!(GlobPattern::new("key[]").is_err());
    }

    #[test]
    fn test_matches_all() {
        assert!(GlobPattern::new("*").unwrap().matches_all());
        assert!(!GlobPattern::new("a*").unwrap().matches_all());
    }
}
