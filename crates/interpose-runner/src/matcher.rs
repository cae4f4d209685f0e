//! The three ways a marker can be found in an argument vector.
//!
//! Index 0 is the executable that received the invocation and is never
//! searched.

use crate::rules::{looks_like_flag, FlagMatch};

/// The invocation without its executable, joined by single spaces.
pub fn flatten(argv: &[String]) -> String {
    argv.iter().skip(1).map(String::as_str).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Substring of the flattened invocation; may span tokens.
    Text(&'a str),
    /// Substring of a single non-flag token.
    ProgramToken(&'a str),
    /// A token equal to the flag, or its `flag=value` form.
    ExactFlag(&'a str),
}

impl Marker<'_> {
    pub fn matches(&self, argv: &[String]) -> bool {
        match self {
            Marker::Text(text) => flatten(argv).contains(text),
            _ => self.position(argv).is_some(),
        }
    }

    /// Index of the first token matching a token-level marker. A text marker
    /// resolves to the first token that contains it.
    pub fn position(&self, argv: &[String]) -> Option<usize> {
        self.position_from(argv, 1)
    }

    pub fn position_from(&self, argv: &[String], start: usize) -> Option<usize> {
        argv.iter()
            .enumerate()
            .skip(start.max(1))
            .find(|(_, token)| self.token_matches(token))
            .map(|(idx, _)| idx)
    }

    fn token_matches(&self, token: &str) -> bool {
        match self {
            Marker::Text(text) => token.contains(text),
            Marker::ProgramToken(marker) => !looks_like_flag(token) && token.contains(marker),
            Marker::ExactFlag(flag) => flag_token_matches(token, flag, FlagMatch::Exact),
        }
    }
}

pub fn flag_token_matches(token: &str, flag: &str, mode: FlagMatch) -> bool {
    match mode {
        FlagMatch::Exact => {
            token == flag
                || token
                    .strip_prefix(flag)
                    .is_some_and(|rest| rest.starts_with('='))
        }
        FlagMatch::Contains => token.contains(flag),
    }
}

/// True when the token carries its value inline (`flag=value`).
pub fn has_inline_value(token: &str, flag: &str) -> bool {
    token.len() > flag.len() && flag_token_matches(token, flag, FlagMatch::Exact)
}
