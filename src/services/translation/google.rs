// Google Cloud Translation (v2 REST) provider

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::Translator;
use crate::core::config::TranslationConfig;
use crate::core::errors::{TranslationError, TranslationResult};
use crate::services::network::{FetchOptions, NetworkClient};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslatedText {
    translated_text: String,
}

#[derive(Debug, Deserialize)]
struct TranslationsData {
    translations: Vec<TranslatedText>,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: TranslationsData,
}

pub struct GoogleTranslator {
    client: Arc<NetworkClient>,
    url: String,
    options: FetchOptions,
}

impl GoogleTranslator {
    /// # Arguments
    /// * `client` - shared network client
    /// * `config` - endpoint and API key
    /// * `options` - timeout/retry policy for each call
    pub fn new(
        client: Arc<NetworkClient>,
        config: &TranslationConfig,
        options: FetchOptions,
    ) -> TranslationResult<Self> {
        let key = config.api_key.as_deref().unwrap_or_default();
        let url = Url::parse_with_params(&config.endpoint, &[("key", key)])
            .map_err(|e| TranslationError::InvalidResponse(format!("invalid endpoint: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            options,
        })
    }
}

pub(crate) fn parse_translation(body: &[u8]) -> TranslationResult<String> {
    let parsed: TranslateResponse = serde_json::from_slice(body)
        .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
    parsed
        .data
        .translations
        .into_iter()
        .next()
        .map(|t| t.translated_text)
        .ok_or_else(|| TranslationError::InvalidResponse("no translations in response".to_string()))
}

#[async_trait]
impl Translator for GoogleTranslator {
    #[instrument(skip(self))]
    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        _source_hint: Option<&str>,
    ) -> TranslationResult<String> {
        // The provider detects the source itself; the hint only keys the cache
        let body = json!({
            "q": [text],
            "target": target_language,
            "format": "text",
        });

        let bytes = self.client.post_json(&self.url, &body, &self.options).await?;
        let translated = parse_translation(&bytes)?;
        debug!("'{}' -> '{}' ({})", text, translated, target_language);
        Ok(translated)
    }
}
