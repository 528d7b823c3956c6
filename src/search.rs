//! Web search collaborator
//!
//! Keyword-triggered lookups (Brave, Serper) used to enrich prompts

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default number of results folded into a prompt
pub const DEFAULT_RESULT_LIMIT: usize = 3;

/// Search result from web search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Result title
    pub title: String,
    /// Result URL
    pub url: String,
    /// Result snippet/description
    pub snippet: String,
}

/// Ranked lookup used for prompt enrichment
#[async_trait]
pub trait SearchCollaborator: Send + Sync {
    /// Return at most `limit` results, best first
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

/// Search provider configuration
#[derive(Debug)]
pub enum SearchProvider {
    /// Brave Search API
    Brave {
        /// API key for Brave Search
        api_key: SecretString,
    },
    /// Serper (Google) Search API
    Serper {
        /// API key for Serper
        api_key: SecretString,
    },
}

/// HTTP web search
pub struct WebSearch {
    provider: SearchProvider,
    client: reqwest::Client,
}

/// Brave Search API response
#[derive(Debug, Deserialize)]
struct BraveSearchResponse {
    web: Option<BraveWebResults>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResults {
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

/// Serper API response
#[derive(Debug, Deserialize)]
struct SerperSearchResponse {
    organic: Option<Vec<SerperResult>>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Serper API request body
#[derive(Debug, Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

impl WebSearch {
    /// Create a new web search with the given provider
    #[must_use]
    pub fn new(provider: SearchProvider) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
        }
    }

    /// Brave Search
    #[must_use]
    pub fn brave(api_key: SecretString) -> Self {
        Self::new(SearchProvider::Brave { api_key })
    }

    /// Serper (Google) Search
    #[must_use]
    pub fn serper(api_key: SecretString) -> Self {
        Self::new(SearchProvider::Serper { api_key })
    }

    /// Search using Brave Search API
    async fn search_brave(
        &self,
        api_key: &SecretString,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", api_key.expose_secret())
            .query(&[("q", query), ("count", &limit.to_string())])
            .send()
            .await?;

        let response = response
            .error_for_status()
            .map_err(|e| Error::Search(format!("brave: {e}")))?;

        let brave_response: BraveSearchResponse = response.json().await?;

        Ok(brave_response
            .web
            .map(|web| {
                web.results
                    .into_iter()
                    .map(|r| SearchResult {
                        title: r.title,
                        url: r.url,
                        snippet: r.description,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Search using Serper API
    async fn search_serper(
        &self,
        api_key: &SecretString,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", api_key.expose_secret())
            .json(&SerperRequest { q: query, num: limit })
            .send()
            .await?;

        let response = response
            .error_for_status()
            .map_err(|e| Error::Search(format!("serper: {e}")))?;

        let serper_response: SerperSearchResponse = response.json().await?;

        Ok(serper_response
            .organic
            .map(|organic| {
                organic
                    .into_iter()
                    .map(|r| SearchResult {
                        title: r.title,
                        url: r.link,
                        snippet: r.snippet,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl SearchCollaborator for WebSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let limit = limit.max(1);
        let mut results = match &self.provider {
            SearchProvider::Brave { api_key } => self.search_brave(api_key, query, limit).await?,
            SearchProvider::Serper { api_key } => self.search_serper(api_key, query, limit).await?,
        };
        results.truncate(limit);
        tracing::debug!(query, count = results.len(), "web search complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_pick_provider() {
        let search = WebSearch::brave(SecretString::from("k".to_string()));
        assert!(matches!(search.provider, SearchProvider::Brave { .. }));

        let search = WebSearch::serper(SecretString::from("k".to_string()));
        assert!(matches!(search.provider, SearchProvider::Serper { .. }));
    }

    #[test]
    fn brave_response_parses_without_descriptions() {
        let body = r#"{"web":{"results":[{"title":"Urea","url":"https://a.example"}]}}"#;
        let parsed: BraveSearchResponse = serde_json::from_str(body).unwrap();
        let results = parsed.web.unwrap().results;
        assert_eq!(results[0].title, "Urea");
        assert!(results[0].description.is_empty());
    }

    #[test]
    fn serper_response_parses() {
        let body = r#"{"organic":[{"title":"PM-KISAN","link":"https://b.example","snippet":"Income support"}]}"#;
        let parsed: SerperSearchResponse = serde_json::from_str(body).unwrap();
        let organic = parsed.organic.unwrap();
        assert_eq!(organic[0].link, "https://b.example");
    }
}
