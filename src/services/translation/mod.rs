// Label translation: provider interface and multi-target fan-out

pub mod cache;
pub mod google;
pub mod language_detect;

use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::core::errors::{TranslationError, TranslationResult};

pub use cache::CachedTranslator;
pub use google::GoogleTranslator;
pub use language_detect::detect_language;

/// A translation backend
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        source_hint: Option<&str>,
    ) -> TranslationResult<String>;
}

/// Returns the input unchanged; used when no provider is configured
pub struct IdentityTranslator;

#[async_trait]
impl Translator for IdentityTranslator {
    async fn translate(
        &self,
        text: &str,
        _target_language: &str,
        _source_hint: Option<&str>,
    ) -> TranslationResult<String> {
        Ok(text.to_string())
    }
}

/// Translates one label into every requested language
pub struct TranslationService {
    provider: Arc<dyn Translator>,
}

impl TranslationService {
    pub fn new(provider: Arc<dyn Translator>) -> Self {
        Self { provider }
    }

    /// Translate `text` into each of `targets` concurrently
    ///
    /// Either every target succeeds and the map holds exactly one entry per
    /// distinct target code, or the first failure is returned and no
    /// translations are surfaced.
    #[instrument(skip(self), fields(targets = targets.len()))]
    pub async fn translate_all(
        &self,
        text: &str,
        targets: &[String],
    ) -> TranslationResult<HashMap<String, String>> {
        let mut codes: Vec<&str> = Vec::with_capacity(targets.len());
        for code in targets.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        if codes.is_empty() {
            return Err(TranslationError::NoTargets);
        }

        let hint = detect_language(text);
        debug!("Source language hint for '{}': {:?}", text, hint);

        let calls = codes.iter().map(|&code| {
            let provider = Arc::clone(&self.provider);
            async move {
                provider
                    .translate(text, code, hint)
                    .await
                    .map(|translated| (code.to_string(), translated))
            }
        });
        let translations: HashMap<String, String> = try_join_all(calls).await?.into_iter().collect();

        info!("Translated '{}' into {} languages", text, translations.len());
        Ok(translations)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Answers "<text>@<target>" and records the hints it saw; fails for listed targets
    #[derive(Default)]
    pub(crate) struct StubTranslator {
        pub fail_for: Vec<String>,
        pub calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl Translator for StubTranslator {
        async fn translate(
            &self,
            text: &str,
            target_language: &str,
            source_hint: Option<&str>,
        ) -> TranslationResult<String> {
            self.calls.lock().push((
                text.to_string(),
                target_language.to_string(),
                source_hint.map(str::to_string),
            ));
            if self.fail_for.iter().any(|t| t == target_language) {
                return Err(TranslationError::Failed { status: 500 });
            }
            Ok(format!("{}@{}", text, target_language))
        }
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_one_entry_per_target() {
        let service = TranslationService::new(Arc::new(StubTranslator::default()));
        let result = service
            .translate_all("apple", &codes(&["es", "fr", "ja"]))
            .await
            .unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result["es"], "apple@es");
        assert_eq!(result["ja"], "apple@ja");
    }

    #[tokio::test]
    async fn test_single_failure_fails_everything() {
        let stub = StubTranslator {
            fail_for: vec!["fr".to_string()],
            ..Default::default()
        };
        let service = TranslationService::new(Arc::new(stub));
        let err = service
            .translate_all("apple", &codes(&["es", "fr", "ja"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::Failed { status: 500 }));
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_targets() {
        let stub = Arc::new(StubTranslator::default());
        let service = TranslationService::new(stub.clone());
        let result = service
            .translate_all("apple", &codes(&["es", " es", ""]))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(stub.calls.lock().len(), 1);

        let err = service.translate_all("apple", &[]).await.unwrap_err();
        assert!(matches!(err, TranslationError::NoTargets));
    }

    #[tokio::test]
    async fn test_hint_passed_only_when_confident() {
        let stub = Arc::new(StubTranslator::default());
        let service = TranslationService::new(stub.clone());
        service.translate_all("apple", &codes(&["es"])).await.unwrap();
        service.translate_all("苹果", &codes(&["es"])).await.unwrap();

        let calls = stub.calls.lock();
        assert_eq!(calls[0].2, None);
        assert_eq!(calls[1].2.as_deref(), Some("zh"));
    }

    #[tokio::test]
    async fn test_identity_translator() {
        let t = IdentityTranslator;
        assert_eq!(t.translate("cup", "de", None).await.unwrap(), "cup");
    }
}
