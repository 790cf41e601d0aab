//! RFC 6238 time-based one-time passwords.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::{MfaError, Result};

/// Size of a freshly generated TOTP seed in bytes (160 bits, per RFC 4226).
pub const SEED_SIZE: usize = 20;

/// Default number of digits in a code.
const DEFAULT_DIGITS: usize = 6;

/// Default time step in seconds.
const DEFAULT_STEP: u64 = 30;

/// Default skew tolerance in time steps, checked either side of the current
/// step. Widening this trades security for usability; ±1 step (±30s) is the
/// deliberate default.
const DEFAULT_SKEW: u8 = 1;

/// Configuration for TOTP generation and verification.
#[derive(Clone, Debug)]
pub struct TotpConfig {
    /// Issuer name shown in authenticator apps.
    pub issuer: String,
    /// Number of digits in the code (default: 6).
    pub digits: usize,
    /// Time step in seconds (default: 30).
    pub step: u64,
    /// Steps checked either side of the current one (default: 1).
    pub skew: u8,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "App".to_string(),
            digits: DEFAULT_DIGITS,
            step: DEFAULT_STEP,
            skew: DEFAULT_SKEW,
        }
    }
}

impl TotpConfig {
    /// Create a new TOTP config with the given issuer name.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Default::default()
        }
    }

    /// Set the number of digits.
    #[must_use]
    pub fn digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }

    /// Set the time step in seconds.
    #[must_use]
    pub fn step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Set the skew tolerance in time steps.
    #[must_use]
    pub fn skew(mut self, skew: u8) -> Self {
        self.skew = skew;
        self
    }
}

/// Generates seeds, computes time-step codes, and verifies submitted codes
/// against a tolerance window.
#[derive(Clone)]
pub struct TotpEngine {
    config: TotpConfig,
}

impl TotpEngine {
    /// Create a new engine with the given configuration.
    #[must_use]
    pub fn new(config: TotpConfig) -> Self {
        Self { config }
    }

    /// Get the engine configuration.
    #[must_use]
    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// Generate a fresh random seed.
    #[must_use]
    pub fn generate_seed(&self) -> [u8; SEED_SIZE] {
        let mut seed = [0u8; SEED_SIZE];
        OsRng.fill_bytes(&mut seed);
        seed
    }

    /// Base32-encode a seed the way authenticator apps expect it.
    #[must_use]
    pub fn seed_base32(&self, seed: &[u8]) -> String {
        Secret::Raw(seed.to_vec()).to_encoded().to_string()
    }

    /// Decode a base32-encoded seed back to raw bytes.
    pub fn decode_seed(&self, encoded: &str) -> Result<Vec<u8>> {
        Secret::Encoded(encoded.to_string())
            .to_bytes()
            .map_err(|e| MfaError::InvalidInput(format!("invalid base32 seed: {e:?}")))
    }

    /// Build the `otpauth://totp/...` provisioning URI for a seed.
    ///
    /// Pure formatting, no I/O. The issuer comes from the engine config.
    pub fn provisioning_uri(&self, seed: &[u8], account_label: &str) -> Result<String> {
        let totp = self.build(seed, account_label)?;
        Ok(totp.get_url())
    }

    /// Compute the code for the time step containing `time`.
    pub fn current_code(&self, seed: &[u8], time: SystemTime) -> Result<String> {
        let totp = self.build(seed, "")?;
        Ok(totp.generate(unix_secs(time)?))
    }

    /// Verify a submitted code against the time step containing `time`,
    /// tolerating the configured skew either side.
    ///
    /// The format gate (exactly `digits` ASCII digits, after stripping spaces
    /// and dashes) runs before any cryptographic work; it is not a
    /// timing-sensitive check. Candidate codes are compared in constant time,
    /// and every step in the window is evaluated even after a match.
    pub fn verify_at(&self, seed: &[u8], submitted: &str, time: SystemTime) -> Result<bool> {
        let submitted = submitted.replace([' ', '-'], "");
        if !is_code_format(&submitted, self.config.digits) {
            return Ok(false);
        }

        let totp = self.build(seed, "")?;
        let now = unix_secs(time)?;
        let skew = i64::from(self.config.skew);

        let mut matched = false;
        for offset in -skew..=skew {
            let step_time = now as i64 + offset * self.config.step as i64;
            if step_time < 0 {
                continue;
            }
            let expected = totp.generate(step_time as u64);
            matched |= bool::from(expected.as_bytes().ct_eq(submitted.as_bytes()));
        }

        Ok(matched)
    }

    fn build(&self, seed: &[u8], account_label: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            self.config.digits,
            self.config.skew,
            self.config.step,
            seed.to_vec(),
            Some(self.config.issuer.clone()),
            account_label.to_string(),
        )
        .map_err(|e| MfaError::Internal(format!("invalid TOTP parameters: {e}")))
    }
}

/// Exactly `digits` ASCII digits.
fn is_code_format(code: &str, digits: usize) -> bool {
    code.len() == digits && code.bytes().all(|b| b.is_ascii_digit())
}

fn unix_secs(time: SystemTime) -> Result<u64> {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| MfaError::Internal("system time before Unix epoch".to_string()))
}
