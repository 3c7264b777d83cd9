//! External legal-authority lookup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::AuthorityError;

/// Answer to one existence query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthorityHit {
    pub exists: bool,
    #[serde(default)]
    pub source_ref: Option<String>,
    /// The service matched several authorities and cannot pick one.
    #[serde(default)]
    pub ambiguous: bool,
}

impl AuthorityHit {
    pub fn found(source_ref: impl Into<String>) -> Self {
        Self {
            exists: true,
            source_ref: Some(source_ref.into()),
            ambiguous: false,
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }

    pub fn ambiguous() -> Self {
        Self {
            ambiguous: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait AuthoritySearch: Send + Sync {
    async fn query(&self, citation_text: &str) -> Result<AuthorityHit, AuthorityError>;
}

// ═══════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════

/// `GET {base_url}/search?q=<citation>` returning `{exists, source_ref?, ambiguous?}`.
pub struct HttpAuthoritySearch {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAuthoritySearch {
    /// `timeout` bounds the HTTP exchange; the verifier applies its own
    /// per-citation timeout on top.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }
}

#[async_trait]
impl AuthoritySearch for HttpAuthoritySearch {
    async fn query(&self, citation_text: &str) -> Result<AuthorityHit, AuthorityError> {
        let mut request = self
            .client
            .get(self.search_url())
            .query(&[("q", citation_text)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthorityError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthorityError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<AuthorityHit>()
            .await
            .map_err(|e| AuthorityError::InvalidResponse(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════

/// Fixed authority index for tests and offline runs.
///
/// Lookups are exact on the query text. Unknown text is a confident miss.
#[derive(Default)]
pub struct InMemoryAuthority {
    known: HashMap<String, String>,
    ambiguous: HashSet<String>,
    unavailable: HashSet<String>,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authority(mut self, citation: &str, source_ref: &str) -> Self {
        self.known.insert(citation.to_string(), source_ref.to_string());
        self
    }

    /// Answer `ambiguous` for this query text.
    pub fn with_ambiguous(mut self, citation: &str) -> Self {
        self.ambiguous.insert(citation.to_string());
        self
    }

    /// Fail with a transport error for this query text.
    pub fn with_unavailable(mut self, citation: &str) -> Self {
        self.unavailable.insert(citation.to_string());
        self
    }

    /// Sleep before answering every query.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn query_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuthoritySearch for InMemoryAuthority {
    async fn query(&self, citation_text: &str) -> Result<AuthorityHit, AuthorityError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(citation_text.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.contains(citation_text) {
            return Err(AuthorityError::Http("authority unavailable".into()));
        }
        if self.ambiguous.contains(citation_text) {
            return Ok(AuthorityHit::ambiguous());
        }
        Ok(match self.known.get(citation_text) {
            Some(source_ref) => AuthorityHit::found(source_ref.clone()),
            None => AuthorityHit::missing(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_parses_with_optional_fields() {
        let hit: AuthorityHit = serde_json::from_str(r#"{"exists":false}"#).unwrap();
        assert_eq!(hit, AuthorityHit::missing());
        let hit: AuthorityHit =
            serde_json::from_str(r#"{"exists":true,"source_ref":"[1932] UKHL 100"}"#).unwrap();
        assert_eq!(hit.source_ref.as_deref(), Some("[1932] UKHL 100"));
        assert!(!hit.ambiguous);
    }

    #[test]
    fn http_search_url_trims_slash() {
        let search =
            HttpAuthoritySearch::new("https://authority.example/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(search.search_url(), "https://authority.example/search");
    }

    #[tokio::test]
    async fn in_memory_lookup() {
        let authority = InMemoryAuthority::new()
            .with_authority("A v B [2000] AC 1", "ref-a")
            .with_ambiguous("C v D [2001] AC 2")
            .with_unavailable("E v F [2002] AC 3");

        assert_eq!(
            authority.query("A v B [2000] AC 1").await.unwrap(),
            AuthorityHit::found("ref-a")
        );
        assert!(authority.query("C v D [2001] AC 2").await.unwrap().ambiguous);
        assert!(authority.query("E v F [2002] AC 3").await.is_err());
        assert!(!authority.query("nothing").await.unwrap().exists);
        assert_eq!(authority.query_count(), 4);
        assert_eq!(authority.queries()[3], "nothing");
    }

    #[tokio::test]
    async fn unreachable_http_authority_errors() {
        let search =
            HttpAuthoritySearch::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            search.query("A v B [2000] AC 1").await,
            Err(AuthorityError::Http(_))
        ));
    }
}
