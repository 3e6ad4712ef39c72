//! Turns the rig's text lines into [`Record`]s.
//!
//! A frame is six whitespace separated tokens:
//!
//! ```text
//! <velocity> <density> <f1> <f2> <f3> <f4>
//! ```
//!
//! Velocity and density are passed through untouched. The four forces are
//! parsed as floats, and any force that reads exactly zero is replaced by the
//! last non-zero value seen on that channel. The load cell amplifiers
//! occasionally report a spurious zero, and this keeps those out of the
//! recorded data. It is a heuristic, not a correction.

use nom::{
    bytes::complete::{take_till1, take_while, take_while1},
    combinator::all_consuming,
    multi::separated_list0,
    number::complete::double,
    sequence::delimited,
    Finish, IResult,
};
use thiserror::Error;

use crate::{Forces, CHANNELS};

/// Number of tokens in a well formed frame.
pub const FRAME_TOKENS: usize = 2 + CHANNELS;

/// Value every channel of the zero-substitution cache starts at, before the
/// first non-zero reading arrives on it.
pub const DEFAULT_SEED: f64 = 0.0;

/// One decoded sample. `forces` are raw (uncalibrated) values with the
/// zero substitution already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Air velocity token, verbatim
    pub velocity: String,
    /// Air density token, verbatim
    pub density: String,
    /// Raw forces F1..F4
    pub forces: Forces,
}

/// A frame with six tokens where a force was not a number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A force token did not parse as a float
    #[error("force channel F{channel} is not a number: {token:?}")]
    NotNumeric {
        /// One-based channel number
        channel: usize,
        /// The offending token
        token: String,
    },
}

/// Stateful decoder holding the last non-zero raw force of each channel.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    last_raw: Forces,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_seed([DEFAULT_SEED; CHANNELS])
    }
}

impl FrameDecoder {
    /// A decoder whose cache starts at [`DEFAULT_SEED`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder whose cache starts at `seed`.
    pub fn with_seed(seed: Forces) -> Self {
        Self { last_raw: seed }
    }

    /// The values that would be substituted for a zero reading right now.
    pub fn last_raw_forces(&self) -> &Forces {
        &self.last_raw
    }

    /// Decode one line.
    ///
    /// Returns `Ok(None)` when the line does not have exactly
    /// [`FRAME_TOKENS`] tokens. Returns an error when a force token is not
    /// numeric; in that case the cache is left as it was.
    pub fn decode(&mut self, line: &str) -> Result<Option<Record>, DecodeError> {
        let tokens = match split_tokens(line).finish() {
            Ok((_, tokens)) => tokens,
            Err(_) => return Ok(None),
        };

        let [velocity, density, force_tokens @ ..] = tokens.as_slice() else {
            return Ok(None);
        };
        if force_tokens.len() != CHANNELS {
            return Ok(None);
        }

        let mut forces = [0.0; CHANNELS];
        for (channel, (slot, token)) in forces.iter_mut().zip(force_tokens).enumerate() {
            *slot = parse_force(token).ok_or_else(|| DecodeError::NotNumeric {
                channel: channel + 1,
                token: token.to_string(),
            })?;
        }

        for (value, cached) in forces.iter_mut().zip(self.last_raw.iter_mut()) {
            if *value == 0.0 {
                *value = *cached;
            } else {
                *cached = *value;
            }
        }

        Ok(Some(Record {
            velocity: velocity.to_string(),
            density: density.to_string(),
            forces,
        }))
    }
}

fn gap(s: &str) -> IResult<&str, &str> {
    take_while1(char::is_whitespace)(s)
}

fn token(s: &str) -> IResult<&str, &str> {
    take_till1(char::is_whitespace)(s)
}

fn split_tokens(s: &str) -> IResult<&str, Vec<&str>> {
    delimited(
        take_while(char::is_whitespace),
        separated_list0(gap, token),
        take_while(char::is_whitespace),
    )(s)
}

fn parse_force(token: &str) -> Option<f64> {
    all_consuming(double::<&str, nom::error::Error<&str>>)(token)
        .finish()
        .ok()
        .map(|(_, value)| value)
}
