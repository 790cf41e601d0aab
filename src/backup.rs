//! Single-use backup codes for account recovery.

use std::collections::HashSet;
use std::time::SystemTime;

use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::crypto::{CryptoBox, Envelope};
use crate::error::Result;

/// Default number of codes in a batch.
const DEFAULT_COUNT: usize = 10;

/// Default length of each code in characters. 16 characters from a 32-symbol
/// alphabet is 80 bits of entropy.
const DEFAULT_LENGTH: usize = 16;

/// Characters per dash-separated group in the display form.
const GROUP_SIZE: usize = 4;

/// Fewer remaining codes than this after a successful use is a warning the
/// caller should surface to the user.
pub const LOW_CODES_THRESHOLD: usize = 3;

// No 0, O, 1, I to avoid confusion when copying by hand.
const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// One encrypted backup code inside an account's settings record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCodeEntry {
    /// The encrypted code.
    pub envelope: Envelope,
    /// Whether the code has been consumed. Once set it never clears.
    pub used: bool,
    /// When the code was consumed.
    pub used_at: Option<SystemTime>,
}

impl BackupCodeEntry {
    /// Create a fresh, unused entry.
    #[must_use]
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            used: false,
            used_at: None,
        }
    }
}

/// Generates batches of high-entropy backup codes.
#[derive(Clone, Debug)]
pub struct BackupCodeGenerator {
    /// Number of codes per batch (default: 10).
    pub count: usize,
    /// Length of each code in characters (default: 16).
    pub length: usize,
}

impl Default for BackupCodeGenerator {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            length: DEFAULT_LENGTH,
        }
    }
}

impl BackupCodeGenerator {
    /// Create a generator with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of codes per batch.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Set the length of each code.
    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Generate a batch of unique codes.
    #[must_use]
    pub fn generate(&self) -> Vec<String> {
        let mut rng = OsRng;
        let mut seen = HashSet::with_capacity(self.count);
        let mut codes = Vec::with_capacity(self.count);

        while codes.len() < self.count {
            let code: String = (0..self.length)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect();
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        codes
    }

    /// Whether a normalized string has the shape of one of this generator's
    /// codes. Backup codes use a visually distinct alphabet and length, so
    /// this never overlaps with a TOTP code.
    #[must_use]
    pub fn matches_format(&self, normalized: &str) -> bool {
        normalized.len() == self.length
            && normalized.bytes().all(|b| CHARSET.contains(&b))
    }
}

/// Normalize a submitted code: drop separators, uppercase.
#[must_use]
pub fn normalize(code: &str) -> String {
    code.replace(['-', ' '], "").to_uppercase()
}

/// Format a code for display, grouped for readability (`ABCD-EFGH-...`).
#[must_use]
pub fn display_code(code: &str) -> String {
    code.as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

/// Outcome of a consume attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumeResult {
    /// The submitted code matched an unused entry, which is now marked used.
    Consumed {
        /// Unused codes left after this one.
        remaining: usize,
    },
    /// No unused entry matched.
    NoMatch,
}

impl ConsumeResult {
    /// Whether the remaining count is low enough to warn the user.
    #[must_use]
    pub fn is_low(&self) -> bool {
        matches!(self, ConsumeResult::Consumed { remaining } if *remaining < LOW_CODES_THRESHOLD)
    }

    /// Whether the batch is exhausted and regeneration must be forced before
    /// further backup-code logins.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConsumeResult::Consumed { remaining: 0 })
    }
}

/// Compare a submitted code against every unused entry and consume the first
/// match.
///
/// All unused entries are compared in constant time, and scanning continues
/// past a hit so the comparison count does not depend on which slot matched.
/// The caller must hold the account's lock and persist the mutated entries
/// before releasing it; a matched code is permanently unusable.
pub fn verify_and_consume(
    cryptobox: &CryptoBox,
    entries: &mut [BackupCodeEntry],
    submitted: &str,
    now: SystemTime,
) -> Result<ConsumeResult> {
    let submitted = normalize(submitted);

    let mut matched: Option<usize> = None;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.used {
            continue;
        }
        let plaintext = cryptobox.open(&entry.envelope)?;
        let hit = bool::from(plaintext.as_slice().ct_eq(submitted.as_bytes()));
        if hit && matched.is_none() {
            matched = Some(idx);
        }
    }

    match matched {
        Some(idx) => {
            entries[idx].used = true;
            entries[idx].used_at = Some(now);
            let remaining = entries.iter().filter(|e| !e.used).count();
            Ok(ConsumeResult::Consumed { remaining })
        }
        None => Ok(ConsumeResult::NoMatch),
    }
}
