//! Decoded FT8 message text → protocol role, caller, peer and grid.
//!
//! Supported shapes (after stripping a trailing marginal-decode marker such
//! as `a1` or `?`):
//!
//! | Text                    | Kind    | Caller     | Peer   | Grid |
//! |-------------------------|---------|------------|--------|------|
//! | `CQ WB9XYZ EN34`        | CQ      | WB9XYZ     |        | EN34 |
//! | `CQ DX WB9XYZ EN34`     | CQ      | WB9XYZ     |        | EN34 |
//! | `QRZ ZL4/KA1ABC`        | QRZ     | ZL4/KA1ABC |        |      |
//! | `KA1ABC WB9XYZ EN34`    | REPLY   | KA1ABC     | WB9XYZ | EN34 |
//! | `KA1ABC WB9XYZ RR73`    | REPLY   | KA1ABC     | WB9XYZ |      |
//! | `RRR`, `HELLO WORLD`    | UNKNOWN |            |        |      |
//!
//! Shorthand and free text are valid input: they classify as UNKNOWN
//! without an error.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while_m_n, take_while1},
    character::complete::{char, one_of, satisfy},
    combinator::{all_consuming, recognize},
    multi::separated_list1,
};
use thiserror::Error;

use crate::cty::{CountryInfo, CountryTable};
use crate::message::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("empty message")]
    Empty,

    #[error("unsupported message (contains ';'): {0}")]
    Semicolon(String),

    #[error("unknown message: {0}")]
    Unrecognized(String),
}

/// Result of classifying one message text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Classification {
    pub kind: MessageKind,
    pub caller: Option<String>,
    /// Country and zones of the caller, when the caller resolves.
    pub location: Option<CountryInfo>,
    pub grid: Option<String>,
    pub peer: Option<String>,
}

/// Classify `text`, resolving the caller against `table`.
pub fn classify(text: &str, table: &CountryTable) -> Result<Classification, ClassifyError> {
    if text.is_empty() {
        return Err(ClassifyError::Empty);
    }
    if text.contains(';') {
        return Err(ClassifyError::Semicolon(text.to_string()));
    }
    let unrecognized = || ClassifyError::Unrecognized(text.to_string());

    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens
        .last()
        .is_some_and(|last| last.starts_with('a') || *last == "?")
    {
        tokens.pop();
    }
    let Some((&first, mut rest)) = tokens.split_first() else {
        return Err(unrecognized());
    };

    let mut result = Classification::default();

    let directed = match first {
        "CQ" => Some(MessageKind::Cq),
        "QRZ" => Some(MessageKind::Qrz),
        "DE" => Some(MessageKind::De),
        _ => None,
    };

    if let Some(kind) = directed {
        result.kind = kind;
        if let [token, after @ ..] = rest
            && is_indicator(token)
        {
            if after.is_empty() {
                return Err(unrecognized());
            }
            rest = after;
        }
        let [caller, rest @ ..] = rest else {
            return Err(unrecognized());
        };
        if !is_callsign(caller) {
            return Err(unrecognized());
        }
        result.set_caller(caller, table);

        match rest {
            [peer, more @ ..] if is_callsign(peer) => {
                result.peer = Some(peer.to_string());
                if let [grid, ..] = more
                    && is_grid(grid)
                {
                    result.grid = Some(grid.to_string());
                }
            }
            [grid, ..] if is_grid(grid) => result.grid = Some(grid.to_string()),
            _ => {}
        }
        return Ok(result);
    }

    if let [next, more @ ..] = rest
        && is_callsign(first)
    {
        result.set_caller(first, table);
        if is_callsign(next) {
            result.kind = MessageKind::Reply;
            result.peer = Some(next.to_string());
            if let [grid, ..] = more
                && is_grid(grid)
                && *grid != "RR73"
            {
                result.grid = Some(grid.to_string());
            }
        } else if is_grid(next) {
            result.grid = Some(next.to_string());
        }
    }

    Ok(result)
}

impl Classification {
    fn set_caller(&mut self, caller: &str, table: &CountryTable) {
        self.caller = Some(caller.to_string());
        self.location = table.resolve(caller).cloned();
    }
}

fn segment(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit()).parse(input)
}

fn segments(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(char('/'), segment).parse(input)
}

/// Core callsign: 1-3 alphanumerics, a digit, 0-3 alphanumerics, a letter.
fn is_core_callsign(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    let len = bytes.len();
    if !(3..=8).contains(&len) || !bytes[len - 1].is_ascii_uppercase() {
        return false;
    }
    let lowest = len.saturating_sub(5).max(1);
    (lowest..=(len - 2).min(3)).any(|i| bytes[i].is_ascii_digit())
}

/// Full callsign: optional prefix segment, core call, up to two suffix
/// segments, all separated by `/`.
pub fn is_callsign(token: &str) -> bool {
    let Ok((_, parts)) = all_consuming(segments).parse(token) else {
        return false;
    };
    let n = parts.len();
    (0..=1).any(|core| core < n && n - core - 1 <= 2 && is_core_callsign(parts[core]))
}

const GRID_LETTERS: &str = "ABCDEFGHIJKLMNOPQR";

fn grid(input: &str) -> IResult<&str, &str> {
    recognize((
        one_of(GRID_LETTERS),
        one_of(GRID_LETTERS),
        satisfy(|c: char| c.is_ascii_digit()),
        satisfy(|c: char| c.is_ascii_digit()),
    ))
    .parse(input)
}

/// Four-character Maidenhead locator such as `EN34`.
pub fn is_grid(token: &str) -> bool {
    all_consuming(grid).parse(token).is_ok()
}

fn indicator(input: &str) -> IResult<&str, &str> {
    alt((
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        take_while_m_n(1, 4, |c: char| c.is_ascii_uppercase()),
    ))
    .parse(input)
}

/// Zone or DX indicator after CQ: `DX`, `EU`, `POTA`, `000`.
fn is_indicator(token: &str) -> bool {
    all_consuming(indicator).parse(token).is_ok()
}
