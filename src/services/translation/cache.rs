// LRU translation cache in front of any provider

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

use super::Translator;
use crate::core::errors::TranslationResult;
use crate::utils::Metrics;

/// LRU cache in front of any translator.
///
/// Only successful translations are cached; failures always reach the
/// wrapped provider again on the next call.
pub struct CachedTranslator {
    inner: Arc<dyn Translator>,
    cache: Mutex<LruCache<u64, String>>,
    metrics: Option<Metrics>,
}

impl CachedTranslator {
    pub fn new(inner: Arc<dyn Translator>, capacity: NonZeroUsize, metrics: Option<Metrics>) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics,
        }
    }

    /// xxh3 over (text, target, hint), NUL separated
    pub fn cache_key(text: &str, target_language: &str, source_hint: Option<&str>) -> u64 {
        let hint = source_hint.unwrap_or("");
        let mut buf = Vec::with_capacity(text.len() + target_language.len() + hint.len() + 2);
        buf.extend_from_slice(text.as_bytes());
        buf.push(0);
        buf.extend_from_slice(target_language.as_bytes());
        buf.push(0);
        buf.extend_from_slice(hint.as_bytes());
        xxh3_64(&buf)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

#[async_trait]
impl Translator for CachedTranslator {
    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        source_hint: Option<&str>,
    ) -> TranslationResult<String> {
        let key = Self::cache_key(text, target_language, source_hint);

        let cached = self.cache.lock().get(&key).cloned();
        if let Some(hit) = cached {
            if let Some(m) = &self.metrics {
                m.record_cache_hit();
            }
            return Ok(hit);
        }
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }

        let translated = self.inner.translate(text, target_language, source_hint).await?;

        let size = {
            let mut cache = self.cache.lock();
            cache.put(key, translated.clone());
            cache.len()
        };
        if let Some(m) = &self.metrics {
            m.update_cache_size(size);
        }
        Ok(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::translation::tests::StubTranslator;

    fn cached(stub: Arc<StubTranslator>, capacity: usize, metrics: &Metrics) -> CachedTranslator {
        CachedTranslator::new(stub, NonZeroUsize::new(capacity).unwrap(), Some(metrics.clone()))
    }

    #[tokio::test]
    async fn test_repeat_lookups_hit_cache() {
        let stub = Arc::new(StubTranslator::default());
        let metrics = Metrics::new();
        let cache = cached(stub.clone(), 8, &metrics);

        assert_eq!(cache.translate("apple", "es", None).await.unwrap(), "apple@es");
        assert_eq!(cache.translate("apple", "es", None).await.unwrap(), "apple@es");
        assert_eq!(stub.calls.lock().len(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_size, 1);
    }

    #[tokio::test]
    async fn test_key_includes_target_and_hint() {
        assert_ne!(
            CachedTranslator::cache_key("apple", "es", None),
            CachedTranslator::cache_key("apple", "fr", None)
        );
        assert_ne!(
            CachedTranslator::cache_key("apple", "es", None),
            CachedTranslator::cache_key("apple", "es", Some("en"))
        );
        // Separator keeps field boundaries distinct
        assert_ne!(
            CachedTranslator::cache_key("ab", "c", None),
            CachedTranslator::cache_key("a", "bc", None)
        );
    }

    #[tokio::test]
    async fn test_failures_are_not_cached_and_lru_evicts() {
        let stub = Arc::new(StubTranslator {
            fail_for: vec!["de".to_string()],
            ..Default::default()
        });
        let metrics = Metrics::new();
        let cache = cached(stub.clone(), 2, &metrics);

        assert!(cache.translate("apple", "de", None).await.is_err());
        assert!(cache.translate("apple", "de", None).await.is_err());
        assert_eq!(stub.calls.lock().len(), 2);
        assert!(cache.is_empty());

        for target in ["es", "fr", "ja"] {
            cache.translate("apple", target, None).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
    }
}
