use log::debug;
use regex::Regex;

/// Turns raw OCR output into the key plates are tracked by.
/// Returning `None` rejects the reading.
pub trait PlateNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> Option<String>;
}

impl<N: PlateNormalizer + ?Sized> PlateNormalizer for Box<N> {
    fn normalize(&self, raw: &str) -> Option<String> {
        (**self).normalize(raw)
    }
}

/// Uppercases and keeps ASCII letters and digits only.
#[derive(Debug, Clone)]
pub struct AlphanumericNormalizer {
    min_len: usize,
}

impl Default for AlphanumericNormalizer {
    fn default() -> Self {
        Self { min_len: 1 }
    }
}

impl AlphanumericNormalizer {
    pub fn with_min_len(min_len: usize) -> Self {
        Self {
            min_len: min_len.max(1),
        }
    }
}

impl PlateNormalizer for AlphanumericNormalizer {
    fn normalize(&self, raw: &str) -> Option<String> {
        let text: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        (text.len() >= self.min_len).then_some(text)
    }
}

/// Old private `01A123BC`, new private/diplomatic `A1234BC`,
/// state `AA1234BB`, temporary `TP12345`.
pub const UZBEK_PLATE_PATTERN: &str =
    r"^(\d{2}[A-Z]\d{3}[A-Z]{2}|[A-Z]\d{4}[A-Z]{2}|[A-Z]{2}\d{4}[A-Z]{2}|[A-Z]{2}\d{5})$";

/// Applies an inner normalizer, then requires the result to match a regional grammar.
pub struct PlateFormatFilter<N = AlphanumericNormalizer> {
    inner: N,
    format: Regex,
}

impl PlateFormatFilter<AlphanumericNormalizer> {
    pub fn uzbek() -> Self {
        Self::new(AlphanumericNormalizer::default(), UZBEK_PLATE_PATTERN)
            .expect("built-in plate pattern compiles")
    }
}

impl<N: PlateNormalizer> PlateFormatFilter<N> {
    pub fn new(inner: N, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            inner,
            format: Regex::new(pattern)?,
        })
    }
}

impl<N: PlateNormalizer> PlateNormalizer for PlateFormatFilter<N> {
    fn normalize(&self, raw: &str) -> Option<String> {
        let text = self.inner.normalize(raw)?;
        if self.format.is_match(&text) {
            Some(text)
        } else {
            debug!("plate '{text}' rejected, does not match the configured format");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_punctuation_and_case() {
        let normalizer = AlphanumericNormalizer::default();
        assert_eq!(normalizer.normalize(" 01-a 123 bc\n").as_deref(), Some("01A123BC"));
        assert_eq!(normalizer.normalize("01.A.123.BC"), normalizer.normalize("01A123bc"));
        assert_eq!(normalizer.normalize("--"), None);
    }

    #[test]
    fn minimum_length_rejects_fragments() {
        let normalizer = AlphanumericNormalizer::with_min_len(4);
        assert_eq!(normalizer.normalize("AB1"), None);
        assert_eq!(normalizer.normalize("AB12").as_deref(), Some("AB12"));
    }

    #[test]
    fn substitution_errors_stay_distinct() {
        let normalizer = AlphanumericNormalizer::default();
        assert_ne!(normalizer.normalize("01A123BC"), normalizer.normalize("01A128BC"));
    }

    #[test]
    fn uzbek_grammar_accepts_known_formats() {
        let filter = PlateFormatFilter::uzbek();
        for plate in ["01A123BC", "a1234bc", "AA 1234 BB", "TP12345"] {
            assert!(filter.normalize(plate).is_some(), "{plate} should be accepted");
        }
        for plate in ["01A123B", "ABCDEFG", "1234567", ""] {
            assert!(filter.normalize(plate).is_none(), "{plate} should be rejected");
        }
    }
}
