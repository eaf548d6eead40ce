//! Session codes: short human-shareable pairing tokens.

use std::fmt;

use anyhow::{anyhow, Result};
use rand::Rng;

use crate::config::CODE_LENGTH;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A 6-character uppercase base-36 pairing token.
///
/// Generated client-side with no server allocation or collision check;
/// the 36^6 space makes reuse of a live code practically impossible. The
/// code doubles as the relay channel name suffix (`private-<CODE>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionCode(String);

impl SessionCode {
    /// Generate a fresh random code.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input: uppercases, then validates length and alphabet.
    pub fn parse(input: &str) -> Result<Self> {
        let code = input.trim().to_ascii_uppercase();
        if code.len() != CODE_LENGTH {
            return Err(anyhow!("session code must be {} characters", CODE_LENGTH));
        }
        if !code.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(anyhow!("session code must be uppercase letters and digits"));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relay channel name for this code.
    pub fn channel_name(&self) -> String {
        format!("private-{}", self.0)
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
