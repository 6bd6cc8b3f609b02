//! Combinatorial domain pattern generation
//!
//! A [`PatternSpec`] describes a space of candidate domain names. The space is
//! enumerated by a single integer offset: the variable region is a
//! base-`|character_set|` numeral of `variable_length` digits in
//! **little-endian** digit order (offset 5 over charset `ab` at length 3 is
//! `bab`). The digit order is part of the on-disk contract: generated rows
//! record the offset they were produced from, so it must never change.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum length of a full domain name in octets
pub const MAX_DOMAIN_OCTETS: usize = 253;

/// Maximum length of a single DNS label
pub const MAX_LABEL_OCTETS: usize = 63;

/// Where the variable region sits relative to the constant string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// `variable + constant`
    Prefix,
    /// `constant + variable`
    Suffix,
    /// `variable + constant + variable` (one region, repeated)
    Both,
}

impl PatternType {
    fn canonical_name(self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Both => "both",
        }
    }
}

/// Combinatorial description of a domain space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Variable region placement
    pub pattern_type: PatternType,

    /// Number of variable digits, at least 1
    pub variable_length: u32,

    /// Alphabet the variable region draws from; index 0 maps to digit 0
    pub character_set: String,

    /// Fixed fragment of the label; may be empty
    #[serde(default)]
    pub constant_string: String,

    /// Top-level domain appended after a dot
    pub tld: String,
}

impl PatternSpec {
    /// Validate the declared constraints on the spec fields
    pub fn validate(&self) -> Result<()> {
        if self.variable_length == 0 {
            return Err(Error::validation("variable_length must be at least 1"));
        }
        if self.character_set.is_empty() {
            return Err(Error::validation("character_set must not be empty"));
        }
        if self.tld.is_empty() {
            return Err(Error::validation("tld must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for c in self.character_set.chars() {
            if !seen.insert(c) {
                return Err(Error::Validation(format!(
                    "character_set contains duplicate character '{c}'"
                )));
            }
        }
        Ok(())
    }

    /// Size of the enumerated space: `|character_set| ^ variable_length`
    ///
    /// Arbitrary precision; extreme inputs overflow 63-bit integers.
    pub fn total_combinations(&self) -> BigUint {
        let base = BigUint::from(self.character_set.chars().count());
        base.pow(self.variable_length)
    }

    /// SHA-256 over a fixed-field canonical encoding of the spec
    ///
    /// Each field is emitted in declared order as a 4-byte big-endian length
    /// followed by its UTF-8 bytes, so field boundaries are unambiguous and
    /// the digest is insensitive to serialization or whitespace differences.
    pub fn fingerprint(&self) -> String {
        let variable_length = self.variable_length.to_string();
        let fields: [&str; 5] = [
            self.pattern_type.canonical_name(),
            &variable_length,
            &self.character_set,
            &self.constant_string,
            &self.tld,
        ];
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Produce the domain name at `offset`
    ///
    /// Total on `0 <= offset < total_combinations()`. Returns `Validation` for
    /// offsets outside the space. The returned name is not necessarily a legal
    /// DNS name; callers skip illegal names while still consuming the offset.
    pub fn domain_at(&self, offset: &BigUint) -> Result<String> {
        if *offset >= self.total_combinations() {
            return Err(Error::Validation(format!(
                "offset {offset} outside pattern space of {} combinations",
                self.total_combinations()
            )));
        }

        let alphabet: Vec<char> = self.character_set.chars().collect();
        let base = BigUint::from(alphabet.len());
        let mut variable = String::with_capacity(self.variable_length as usize);
        let mut k = offset.clone();
        for _ in 0..self.variable_length {
            let digit = (&k % &base)
                .to_usize()
                .expect("digit is bounded by alphabet length");
            variable.push(alphabet[digit]);
            k /= &base;
        }
        debug_assert!(k.is_zero());

        let label = match self.pattern_type {
            PatternType::Prefix => format!("{variable}{}", self.constant_string),
            PatternType::Suffix => format!("{}{variable}", self.constant_string),
            PatternType::Both => {
                format!("{variable}{}{variable}", self.constant_string)
            }
        };

        Ok(format!("{label}.{}", self.tld))
    }
}

/// Whether `name` is a legal DNS domain name
///
/// Checks total length, per-label length, the LDH character rule, and
/// hyphen placement. Offsets producing illegal names are skipped during
/// generation but still consume their position in the enumeration.
pub fn is_valid_domain(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DOMAIN_OCTETS {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_OCTETS
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}
