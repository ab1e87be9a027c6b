use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, ACCEPT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{Clients, HttpClient, HttpError};

const GITHUB_JSON: &str = "application/vnd.github+json";

/// A repository as returned by `GET /users/{user}/repos`
///
/// Only `name` is required. The other fields are best effort: a missing,
/// null or malformed value becomes `None`, and anything else the API sends
/// is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Repository {
    pub name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub html_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub fork: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub language: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub stargazers_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Why a repository listing failed
#[derive(Debug, Error)]
pub enum ListError {
    /// No response was obtained (DNS, refused connection, timeout, TLS)
    #[error("network error: {0}")]
    Network(#[source] HttpError),

    /// The server answered with a non-2xx status
    #[error("server returned HTTP {status}")]
    Server { status: u16 },

    /// The body of a successful response was not a repository array
    #[error("failed to parse repository list: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("request cancelled")]
    Cancelled,
}

impl ListError {
    /// Short status line for display to a user
    pub fn user_message(&self) -> &'static str {
        match self {
            ListError::Network(_) => "Check Internet connection",
            ListError::Server { .. } | ListError::Deserialization(_) => "Failed to get response",
            ListError::Cancelled => "Request cancelled",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ListError::Server { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<HttpError> for ListError {
    fn from(e: HttpError) -> Self {
        ListError::Network(e)
    }
}

/// Outcome of a repository listing
pub type RepositoryListResult = std::result::Result<Vec<Repository>, ListError>;

/// Decode a JSON array of repositories, keeping the array order
///
/// An element without a `name` fails the whole batch.
pub fn parse_repositories(body: &[u8]) -> Result<Vec<Repository>, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Names of `repositories`, in order
pub fn repository_names(repositories: &[Repository]) -> Vec<&str> {
    repositories.iter().map(|r| r.name.as_str()).collect()
}

/// Typed binding for the repository listing endpoint
#[derive(Debug, Clone)]
pub struct GitHubClient {
    non_cached: Arc<HttpClient>,
    cached: Arc<HttpClient>,
}

impl GitHubClient {
    pub fn new(clients: &Clients) -> Self {
        Self {
            non_cached: Arc::clone(&clients.non_cached),
            cached: Arc::clone(&clients.cached),
        }
    }

    /// List the public repositories of `user` over the non-cached client
    pub async fn list_repositories(&self, user: &str) -> RepositoryListResult {
        self.fetch(&self.non_cached, user).await
    }

    /// Same request through the cached client
    pub async fn list_repositories_cached(&self, user: &str) -> RepositoryListResult {
        self.fetch(&self.cached, user).await
    }

    /// Like [`list_repositories`](Self::list_repositories), but gives up with
    /// [`ListError::Cancelled`] once `cancel` fires
    pub async fn list_repositories_cancellable(
        &self,
        user: &str,
        cancel: &CancellationToken,
    ) -> RepositoryListResult {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listing repositories for {} cancelled", user);
                Err(ListError::Cancelled)
            }
            result = self.list_repositories(user) => result,
        }
    }

    /// Start the listing on a spawned task; the receiver resolves exactly once
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_list_repositories(
        &self,
        user: impl Into<String>,
    ) -> oneshot::Receiver<RepositoryListResult> {
        let (tx, rx) = oneshot::channel();
        let client = self.clone();
        let user = user.into();

        tokio::spawn(async move {
            let result = client.list_repositories(&user).await;
            if tx.send(result).is_err() {
                debug!("Receiver for {} dropped before the result arrived", user);
            }
        });

        rx
    }

    async fn fetch(&self, http: &HttpClient, user: &str) -> RepositoryListResult {
        info!("Getting GitHub repositories for {}", user);

        let url = http.endpoint(&["users", user, "repos"]);
        let mut request = http.get(url);
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static(GITHUB_JSON));

        let response = match http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request for {} repositories failed: {}", user, e);
                return Err(e.into());
            }
        };

        if !response.is_success() {
            warn!(
                "GitHub returned HTTP {} for {} repositories",
                response.status.as_u16(),
                user
            );
            return Err(ListError::Server {
                status: response.status.as_u16(),
            });
        }

        let repositories = parse_repositories(&response.body).map_err(|e| {
            warn!("Unparseable repository list for {}: {}", user, e);
            ListError::from(e)
        })?;

        info!(
            "Found {} repositories for {}{}",
            repositories.len(),
            user,
            if response.from_cache { " (cached)" } else { "" }
        );
        Ok(repositories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_parse_preserves_order() {
        let repos = parse_repositories(br#"[{"name":"foo"},{"name":"bar"}]"#).unwrap();
        assert_eq!(repository_names(&repos), vec!["foo", "bar"]);
    }

    #[test]
    fn test_parse_empty_array() {
        assert!(parse_repositories(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_maps_snake_case_fields() {
        let body = br#"[{
            "id": 1296269,
            "name": "Hello-World",
            "full_name": "octocat/Hello-World",
            "description": null,
            "html_url": "https://github.com/octocat/Hello-World",
            "fork": true,
            "language": "Rust",
            "stargazers_count": 80,
            "updated_at": "2011-01-26T19:14:43Z",
            "owner": {"login": "octocat"},
            "topics": ["a", "b"]
        }]"#;

        let repos = parse_repositories(body).unwrap();
        let repo = &repos[0];

        assert_eq!(repo.id, Some(1296269));
        assert_eq!(repo.full_name.as_deref(), Some("octocat/Hello-World"));
        assert_eq!(repo.description, None);
        assert_eq!(repo.fork, Some(true));
        assert_eq!(repo.stargazers_count, Some(80));
        assert_eq!(
            repo.updated_at.map(|t| t.to_rfc3339()),
            Some("2011-01-26T19:14:43+00:00".to_string())
        );
    }

    #[test]
    fn test_odd_optional_fields_are_ignored() {
        let body = br#"[
            {"name": "foo", "fork": null, "updated_at": ""},
            {"name": "bar", "id": "not-a-number", "language": 42, "stargazers_count": -1},
            {"name": "baz", "updated_at": "yesterday", "description": {"text": "x"}}
        ]"#;

        let repos = parse_repositories(body).unwrap();

        assert_eq!(repository_names(&repos), vec!["foo", "bar", "baz"]);
        assert_eq!(repos[0].fork, None);
        assert_eq!(repos[0].updated_at, None);
        assert_eq!(repos[1].id, None);
        assert_eq!(repos[1].language, None);
        assert_eq!(repos[1].stargazers_count, None);
        assert_eq!(repos[2].updated_at, None);
        assert_eq!(repos[2].description, None);
    }

    #[test]
    fn test_missing_name_fails_batch() {
        let result = parse_repositories(br#"[{"name":"ok"},{"full_name":"x/y"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_non_array_body_fails() {
        assert!(parse_repositories(br#"{"message":"Not Found"}"#).is_err());
        assert!(parse_repositories(b"<html>").is_err());
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            ListError::Server { status: 500 }.user_message(),
            "Failed to get response"
        );
        let parse_error = parse_repositories(b"nope").unwrap_err();
        assert_eq!(
            ListError::from(parse_error).user_message(),
            "Failed to get response"
        );
        let timeout = ListError::from(HttpError::SendTimeout(std::time::Duration::from_secs(1)));
        assert_eq!(timeout.user_message(), "Check Internet connection");
        assert_matches!(timeout, ListError::Network(_));
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(ListError::Server { status: 404 }.status(), Some(404));
        assert_eq!(ListError::Cancelled.status(), None);
    }

    #[quickcheck]
    fn prop_parse_keeps_length_and_order(names: Vec<String>) -> bool {
        let body = serde_json::to_vec(
            &names
                .iter()
                .map(|name| serde_json::json!({ "name": name, "fork": false }))
                .collect::<Vec<_>>(),
        )
        .unwrap();

        match parse_repositories(&body) {
            Ok(repos) => repository_names(&repos) == names.iter().map(String::as_str).collect::<Vec<_>>(),
            Err(_) => false,
        }
    }
}
