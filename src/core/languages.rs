// Supported target languages

use serde::Serialize;

/// A target language the user can learn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Language {
    pub name: &'static str,
    /// Code sent to the translation provider
    pub code: &'static str,
    /// Locale used to pick a speech voice
    pub speech_code: &'static str,
}

pub const SUPPORTED_LANGUAGES: [Language; 15] = [
    Language { name: "Chinese", code: "zh", speech_code: "zh-CN" },
    Language { name: "Spanish", code: "es", speech_code: "es-ES" },
    Language { name: "French", code: "fr", speech_code: "fr-FR" },
    Language { name: "German", code: "de", speech_code: "de-DE" },
    Language { name: "Italian", code: "it", speech_code: "it-IT" },
    Language { name: "Japanese", code: "ja", speech_code: "ja-JP" },
    Language { name: "Korean", code: "ko", speech_code: "ko-KR" },
    Language { name: "Portuguese", code: "pt", speech_code: "pt-PT" },
    Language { name: "Russian", code: "ru", speech_code: "ru-RU" },
    Language { name: "Arabic", code: "ar", speech_code: "ar-SA" },
    Language { name: "Hindi", code: "hi", speech_code: "hi-IN" },
    Language { name: "Dutch", code: "nl", speech_code: "nl-NL" },
    Language { name: "Turkish", code: "tr", speech_code: "tr-TR" },
    Language { name: "Polish", code: "pl", speech_code: "pl-PL" },
    Language { name: "Vietnamese", code: "vi", speech_code: "vi-VN" },
];

impl Language {
    pub fn default_target() -> Language {
        SUPPORTED_LANGUAGES[0]
    }

    /// Case-insensitive lookup by translation code
    pub fn by_code(code: &str) -> Option<Language> {
        SUPPORTED_LANGUAGES
            .iter()
            .copied()
            .find(|l| l.code.eq_ignore_ascii_case(code))
    }

    /// Case-insensitive lookup by display name
    pub fn by_name(name: &str) -> Option<Language> {
        SUPPORTED_LANGUAGES
            .iter()
            .copied()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Speech locale for a translation code, falling back to the code itself
    pub fn speech_locale_for(code: &str) -> String {
        Self::by_code(code)
            .map(|l| l.speech_code.to_string())
            .unwrap_or_else(|| code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_code_and_name() {
        assert_eq!(Language::by_code("JA").map(|l| l.name), Some("Japanese"));
        assert_eq!(Language::by_name("dutch").map(|l| l.code), Some("nl"));
        assert!(Language::by_code("xx").is_none());
        assert_eq!(Language::default_target().code, "zh");
    }

    #[test]
    fn test_speech_locale_fallback() {
        assert_eq!(Language::speech_locale_for("pt"), "pt-PT");
        assert_eq!(Language::speech_locale_for("sw"), "sw");
    }

    #[test]
    fn test_codes_are_unique() {
        let mut codes: Vec<_> = SUPPORTED_LANGUAGES.iter().map(|l| l.code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), SUPPORTED_LANGUAGES.len());
    }
}
