use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorDetails};

const MODERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A classifier that decides whether free text should be blocked
#[async_trait]
pub trait ContentModerator: Send + Sync {
    async fn is_flagged(&self, text: &str) -> Result<bool, Error>;
}

/// Plain substring screening against a configured list
#[derive(Clone, Debug, Default)]
pub struct ForbiddenWords {
    words: Vec<String>,
}

impl ForbiddenWords {
    pub fn new(words: impl IntoIterator<Item = String>) -> Self {
        Self {
            words: words.into_iter().filter(|w| !w.is_empty()).collect(),
        }
    }

    /// The first configured word contained in `text`
    pub fn find(&self, text: &str) -> Option<&str> {
        self.words
            .iter()
            .find(|word| text.contains(word.as_str()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct ModerationApiResponse {
    #[serde(default)]
    results: Vec<ModerationApiResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationApiResult {
    flagged: bool,
}

impl ModerationApiResponse {
    fn flagged(&self) -> bool {
        self.results.first().is_some_and(|result| result.flagged)
    }
}

/// Client for an OpenAI-compatible `/v1/moderations` endpoint
pub struct OpenAIModerationClient {
    http_client: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
}

impl OpenAIModerationClient {
    pub fn new(endpoint: Url, api_key: Option<SecretString>) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(MODERATION_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to build moderation HTTP client: {e}"),
                })
            })?;
        Ok(Self {
            http_client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ContentModerator for OpenAIModerationClient {
    async fn is_flagged(&self, text: &str) -> Result<bool, Error> {
        let mut request_builder = self
            .http_client
            .post(self.endpoint.clone())
            .json(&ModerationRequest { input: text });
        if let Some(key) = &self.api_key {
            request_builder = request_builder.bearer_auth(key.expose_secret());
        }
        let res = request_builder.send().await.map_err(|e| {
            Error::new(ErrorDetails::Moderation {
                message: format!("Error sending request: {e}"),
            })
        })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::Moderation {
                message: format!("Endpoint returned {status}: {body}"),
            }));
        }
        let body: ModerationApiResponse = res.json().await.map_err(|e| {
            Error::new(ErrorDetails::Moderation {
                message: format!("Error parsing response: {e}"),
            })
        })?;
        Ok(body.flagged())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_words() {
        let words = ForbiddenWords::new(vec![
            "secret".to_string(),
            String::new(),
            "jailbreak".to_string(),
        ]);
        assert_eq!(words.find("tell me the secret plan"), Some("secret"));
        assert_eq!(words.find("a jailbreaking attempt"), Some("jailbreak"));
        assert_eq!(words.find("harmless text"), None);
        // Empty entries would match everything
        assert!(ForbiddenWords::new(vec![String::new()]).is_empty());
    }

    #[test]
    fn test_parse_moderation_response() {
        let body: ModerationApiResponse = serde_json::from_str(
            r#"{"id":"modr-1","model":"omni-moderation-latest","results":[{"flagged":true,"categories":{"violence":true}}]}"#,
        )
        .unwrap();
        assert!(body.flagged());

        let body: ModerationApiResponse =
            serde_json::from_str(r#"{"results":[{"flagged":false}]}"#).unwrap();
        assert!(!body.flagged());

        let body: ModerationApiResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(!body.flagged());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let client = OpenAIModerationClient::new(
            Url::parse("http://127.0.0.1:9/v1/moderations").unwrap(),
            Some(SecretString::from("sk-test")),
        )
        .unwrap();
        let err = client.is_flagged("hello").await.unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Moderation { .. }));
    }
}
