//! Rejection of noise and empty transcriptions

/// Phrases Whisper hallucinates from background noise or silence
const NOISE_TRANSCRIPTIONS: &[&str] = &[
    "",
    ".",
    "..",
    "...",
    "hm",
    "hmm",
    "hmmm",
    "mm",
    "mmm",
    "mhm",
    "uh",
    "um",
    "ah",
    "eh",
    "oh",
    "öh",
    "äh",
    "ja",
    "nej",
    "jo",
    "tack",
    "ok",
    "okay",
    "hej",
    "du",
    "jag",
    "och",
    "att",
    "det",
    "tack för att du tittade.",
    "tack för att du tittade",
    "tack för att ni tittade.",
    "tack för att ni tittade",
    "prenumerera på kanalen.",
    "prenumerera på kanalen",
    "glöm inte att prenumerera",
    "gilla och prenumerera",
    "musik",
    "♪",
    "♫",
    "[musik]",
];

/// Outcome of validating a transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Decide whether a transcription is worth answering
///
/// Rejects empty text, known noise hallucinations (case-insensitive) and
/// anything with fewer than `min_words` words.
#[must_use]
pub fn is_valid_speech(text: &str, min_words: usize) -> Validation {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return Validation::Invalid("empty transcription".to_string());
    }

    let lower = cleaned.to_lowercase();
    if NOISE_TRANSCRIPTIONS.contains(&lower.as_str()) {
        return Validation::Invalid(format!("noise pattern: {lower}"));
    }

    let words = cleaned.split_whitespace().count();
    if words < min_words {
        return Validation::Invalid(format!("too few words ({words} < {min_words})"));
    }

    Validation::Valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_and_noise() {
        assert!(!is_valid_speech("   ", 2).is_valid());
        assert!(!is_valid_speech("Tack för att ni tittade", 2).is_valid());
        assert!(!is_valid_speech("...", 1).is_valid());
        assert!(!is_valid_speech("Hmm", 1).is_valid());
        assert!(!is_valid_speech("♪", 1).is_valid());
        assert!(!is_valid_speech("[Musik]", 1).is_valid());
    }

    #[test]
    fn test_rejects_too_few_words() {
        assert_eq!(
            is_valid_speech("Jarvis", 2),
            Validation::Invalid("too few words (1 < 2)".to_string())
        );
        assert!(!is_valid_speech("Hej", 1).is_valid());
    }

    #[test]
    fn test_accepts_real_sentence() {
        assert!(is_valid_speech("Vad ser du?", 2).is_valid());
        assert!(is_valid_speech("Kör framåt", 2).is_valid());
    }
}
