//! Prompt normalization and locality-sensitive fingerprints.
//!
//! A [`Fingerprint`] is a MinHash signature over the set of words in a
//! normalized prompt. The fraction of equal signature slots estimates the
//! Jaccard similarity of the two word sets, which the content cache uses to
//! find near-duplicate prompts.

use serde::{Deserialize, Serialize};

/// Number of MinHash slots per signature.
pub const SIGNATURE_LEN: usize = 128;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEED_STEP: u64 = 0x9e37_79b9_7f4a_7c15;

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_prompt(prompt: &str) -> String {
    let mapped: String = prompt
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// MinHash signature of a normalized prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u32>);

impl Fingerprint {
    /// Compute the fingerprint of an already-normalized prompt.
    pub fn of_normalized(normalized: &str) -> Self {
        let mut signature = vec![u32::MAX; SIGNATURE_LEN];
        let mut seen = std::collections::HashSet::new();
        for token in normalized.split(' ').filter(|t| !t.is_empty()) {
            if !seen.insert(token) {
                continue;
            }
            let base = fnv1a(token.as_bytes());
            for (i, slot) in signature.iter_mut().enumerate() {
                let seed = (i as u64 + 1).wrapping_mul(SEED_STEP);
                let h = (splitmix64(base ^ seed) >> 32) as u32;
                if h < *slot {
                    *slot = h;
                }
            }
        }
        Self(signature)
    }

    /// Normalize and fingerprint a raw prompt.
    pub fn of_prompt(prompt: &str) -> Self {
        Self::of_normalized(&normalize_prompt(prompt))
    }

    /// Estimated Jaccard similarity in `[0.0, 1.0]`.
    ///
    /// Returns `0.0` for signatures of different lengths.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let equal = self.0.iter().zip(&other.0).filter(|(a, b)| a == b).count();
        equal as f64 / self.0.len() as f64
    }

    /// Bytes held by the signature, for index budget accounting.
    pub fn size_bytes(&self) -> usize {
        self.0.len() * std::mem::size_of::<u32>()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("word{i}")).collect()
    }

    // -- normalize_prompt --

    #[test]
    fn normalize_collapses_case_and_punctuation() {
        assert_eq!(
            normalize_prompt("  A Red  Fox, in the SNOW!  "),
            "a red fox in the snow"
        );
    }

    #[test]
    fn normalize_empty_is_empty() {
        assert_eq!(normalize_prompt("?!  ..."), "");
    }

    // -- similarity --

    #[test]
    fn identical_prompts_are_fully_similar() {
        let a = Fingerprint::of_prompt("a lighthouse on a cliff at dusk");
        let b = Fingerprint::of_prompt("A lighthouse, on a cliff at dusk.");
        assert!((a.similarity(&b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn one_word_change_in_long_prompt_stays_similar() {
        let base = words(40);
        let mut changed = base.clone();
        changed[7] = "zebra".to_string();

        let a = Fingerprint::of_prompt(&base.join(" "));
        let b = Fingerprint::of_prompt(&changed.join(" "));
        let score = a.similarity(&b);
        // True Jaccard is 39/41 ~ 0.95.
        assert!(score > 0.85, "similarity was {score}");
        assert!(score < 1.0);
    }

    #[test]
    fn many_word_changes_drop_below_audio_threshold() {
        let base = words(40);
        let mut changed = base.clone();
        for (i, slot) in changed.iter_mut().enumerate().take(8) {
            *slot = format!("other{i}");
        }
        let a = Fingerprint::of_prompt(&base.join(" "));
        let b = Fingerprint::of_prompt(&changed.join(" "));
        // True Jaccard is 32/48 ~ 0.67.
        assert!(a.similarity(&b) < 0.95);
    }

    #[test]
    fn unrelated_prompts_are_dissimilar() {
        let a = Fingerprint::of_prompt("alpha beta gamma delta epsilon");
        let b = Fingerprint::of_prompt("zeta eta theta iota kappa");
        assert!(a.similarity(&b) < 0.3);
    }

    #[test]
    fn size_accounts_every_slot() {
        assert_eq!(Fingerprint::of_prompt("x").size_bytes(), SIGNATURE_LEN * 4);
    }
}
