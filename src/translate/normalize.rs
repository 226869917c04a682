//! Source-language detection used by the "already in the target language"
//! fast path.

/// Language oracle: returns a language code for `text`, or None if unsure.
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<String>;
}

/// Detects the dominant language of `text` using whatlang.
/// Returns a code in the same scheme as the target-language setting, or
/// None if detection is unreliable.
pub fn detect_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(lang_to_code(info.lang()))
}

fn lang_to_code(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Cmn => "zh-Hans",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        _ => "other",
    }
    .to_string()
}

/// Default detector backed by whatlang.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<String> {
        detect_language(text)
    }
}

/// Remove all whitespace, including the ideographic space (U+3000).
pub fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Compare language codes by primary subtag, case-insensitively
/// (`zh-Hans` matches `zh`, `en-US` matches `en`).
pub fn same_language(detected: &str, target: &str) -> bool {
    fn primary(code: &str) -> &str {
        code.split(['-', '_']).next().unwrap_or(code)
    }
    let (a, b) = (primary(detected), primary(target));
    !a.is_empty() && a != "other" && a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_english_and_chinese() {
        assert_eq!(
            detect_language("The weather is lovely today, so we decided to take a long walk through the park and then have lunch together").as_deref(),
            Some("en")
        );
        assert_eq!(
            detect_language("今天天气很好，我们一起去公园散步吧，顺便买点水果回家").as_deref(),
            Some("zh-Hans")
        );
    }

    #[test]
    fn strips_ascii_and_ideographic_whitespace() {
        assert_eq!(strip_whitespace(" a b\u{3000}c\n"), "abc");
    }

    #[test]
    fn primary_subtag_comparison() {
        assert!(same_language("zh-Hans", "zh-Hans"));
        assert!(same_language("zh-Hans", "zh"));
        assert!(same_language("en", "EN-us"));
        assert!(!same_language("ja", "zh-Hans"));
        assert!(!same_language("other", "other"));
    }
}
