// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Glob patterns shared by every pattern-taking operation.
//!
//! A pattern is compiled once and then matched against many keys, by `scan`,
//! `get_match`, `delete_match`, `get_size_match`, the transaction's match view and
//! the key template registry.
//!
//! Supported syntax:
//! - `*` matches any sequence of characters, including empty and including `:`
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]` match one character of the set, `[^abc]` or `[!abc]` negate it
//! - `\x` matches `x` literally

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyMany,
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl Token {
    fn matches_one(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyOne => true,
            Token::AnyMany => true,
            Token::Class { negated, ranges } => {
                let hit = ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
                hit != *negated
            }
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    pattern: String,
    tokens: Vec<Token>,
}

impl Glob {
    /// Compile a pattern.
    ///
    /// An unterminated `[` is treated as a literal `[`.
    pub fn new(pattern: &str) -> Self {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::with_capacity(chars.len());

        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' => {
                    // Consecutive stars are equivalent to one.
                    if tokens.last() != Some(&Token::AnyMany) {
                        tokens.push(Token::AnyMany);
                    }
                    i += 1;
                }
                '?' => {
                    tokens.push(Token::AnyOne);
                    i += 1;
                }
                '\\' if i + 1 < chars.len() => {
                    tokens.push(Token::Literal(chars[i + 1]));
                    i += 2;
                }
                '[' => match Self::parse_class(&chars, i) {
                    Some((token, next)) => {
                        tokens.push(token);
                        i = next;
                    }
                    None => {
                        tokens.push(Token::Literal('['));
                        i += 1;
                    }
                },
                c => {
                    tokens.push(Token::Literal(c));
                    i += 1;
                }
            }
        }

        Self {
            pattern: pattern.to_string(),
            tokens,
        }
    }

    /// Parse a `[...]` class starting at `start`; returns the token and the index after `]`.
    fn parse_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
        let mut j = start + 1;
        let mut negated = false;
        if j < chars.len() && (chars[j] == '^' || chars[j] == '!') {
            negated = true;
            j += 1;
        }

        let mut ranges = Vec::new();
        let mut first = true;
        while j < chars.len() {
            let c = chars[j];
            if c == ']' && !first {
                return Some((Token::Class { negated, ranges }, j + 1));
            }
            first = false;

            if c == '\\' && j + 1 < chars.len() {
                ranges.push((chars[j + 1], chars[j + 1]));
                j += 2;
            } else if j + 2 < chars.len() && chars[j + 1] == '-' && chars[j + 2] != ']' {
                let (lo, hi) = (c, chars[j + 2]);
                ranges.push(if lo <= hi { (lo, hi) } else { (hi, lo) });
                j += 3;
            } else {
                ranges.push((c, c));
                j += 1;
            }
        }

        None
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// The literal characters before the first wildcard.
    ///
    /// Used to route a pattern to the backend owning that key prefix.
    pub fn literal_prefix(&self) -> String {
        self.tokens
            .iter()
            .map_while(|t| match t {
                Token::Literal(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Whether the pattern contains no wildcard at all.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Match a whole key against the pattern.
    ///
    /// Iterative two-pointer matching, backtracking to the most recent `*`.
    pub fn matches(&self, text: &str) -> bool {
        let txt: Vec<char> = text.chars().collect();
        let pat = &self.tokens;

        let mut pi = 0;
        let mut ti = 0;

        let mut star_pi: Option<usize> = None;
        let mut star_ti = 0;

        while ti < txt.len() {
            if pi < pat.len() && pat[pi] == Token::AnyMany {
                star_pi = Some(pi);
                star_ti = ti;
                pi += 1;
                continue;
            }

            if pi < pat.len() && pat[pi].matches_one(txt[ti]) {
                pi += 1;
                ti += 1;
                continue;
            }

            // Mismatch: let the last star swallow one more character.
            match star_pi {
                Some(sp) => {
                    pi = sp + 1;
                    star_ti += 1;
                    ti = star_ti;
                }
                None => return false,
            }
        }

        // Trailing stars match the empty rest.
        while pi < pat.len() && pat[pi] == Token::AnyMany {
            pi += 1;
        }

        pi == pat.len()
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl From<&str> for Glob {
    fn from(pattern: &str) -> Self {
        Glob::new(pattern)
    }
}
