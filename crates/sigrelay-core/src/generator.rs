//! Channel code generation.
//!
//! Codes are drawn uniformly at random, one character at a time, from a
//! fixed alphabet. A drawn code that is already live is discarded and a
//! new one drawn, up to a bounded number of attempts.
//!
//! Generation has no side effects: the caller must register the returned
//! code in the same critical section that performed the existence check,
//! otherwise two callers can be handed the same code.

use rand::Rng;

use crate::{ChannelCode, DomainError, DomainResult};

/// Characters a generated code is drawn from.
pub const CHANNEL_CODE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of characters in a generated code.
pub const CHANNEL_CODE_LENGTH: usize = 4;

/// Draws before giving up with `IdSpaceExhausted`.
pub const MAX_GENERATE_ATTEMPTS: u32 = 20;

/// Produces short channel codes that do not collide with live channels.
#[derive(Debug, Clone)]
pub struct ChannelIdGenerator {
    alphabet: Vec<char>,
    length: usize,
    max_attempts: u32,
}

impl ChannelIdGenerator {
    /// Creates a generator with a custom alphabet, code length and retry bound.
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidGenerator` if the alphabet is empty or the
    /// length or attempt bound is zero.
    pub fn new(alphabet: &str, length: usize, max_attempts: u32) -> DomainResult<Self> {
        let alphabet: Vec<char> = alphabet.chars().collect();

        if alphabet.is_empty() {
            return Err(DomainError::InvalidGenerator {
                reason: "alphabet is empty".to_string(),
            });
        }
        if length == 0 {
            return Err(DomainError::InvalidGenerator {
                reason: "code length must be positive".to_string(),
            });
        }
        if max_attempts == 0 {
            return Err(DomainError::InvalidGenerator {
                reason: "at least one attempt is required".to_string(),
            });
        }

        Ok(Self {
            alphabet,
            length,
            max_attempts,
        })
    }

    /// Generates a code using the thread-local RNG.
    ///
    /// `exists` is asked whether a candidate is already live.
    pub fn generate<F>(&self, exists: F) -> DomainResult<ChannelCode>
    where
        F: Fn(&ChannelCode) -> bool,
    {
        self.generate_with(&mut rand::thread_rng(), exists)
    }

    /// Generates a code using the supplied RNG.
    ///
    /// # Errors
    ///
    /// `DomainError::IdSpaceExhausted` when every attempt collided.
    pub fn generate_with<R, F>(&self, rng: &mut R, exists: F) -> DomainResult<ChannelCode>
    where
        R: Rng + ?Sized,
        F: Fn(&ChannelCode) -> bool,
    {
        for _ in 0..self.max_attempts {
            let candidate = self.draw(rng);
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }

        Err(DomainError::IdSpaceExhausted {
            attempts: self.max_attempts,
        })
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> ChannelCode {
        let code: String = (0..self.length)
            .filter_map(|_| self.alphabet.get(rng.gen_range(0..self.alphabet.len())))
            .collect();
        ChannelCode::new(code)
    }
}

impl Default for ChannelIdGenerator {
    fn default() -> Self {
        Self {
            alphabet: CHANNEL_CODE_ALPHABET.chars().collect(),
            length: CHANNEL_CODE_LENGTH,
            max_attempts: MAX_GENERATE_ATTEMPTS,
        }
    }
}
