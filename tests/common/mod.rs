/// Common test utilities and helpers for repolist tests
use repolist::{AuthToken, ClientConfig, ClientFactory, Clients, GitHubClient};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Temporary directories for cache, config and preferences files
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp_dir.path().join("http-cache")
    }

    /// Client settings pointing at `base_url` with short timeouts
    pub fn client_config(&self, base_url: &str) -> ClientConfig {
        ClientConfig {
            base_url: base_url.to_string(),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            cache_dir: self.cache_dir(),
            ..ClientConfig::default()
        }
    }

    pub fn clients(&self, base_url: &str, token: &AuthToken) -> Clients {
        ClientFactory::build(&self.client_config(base_url), token).expect("Failed to build clients")
    }

    pub fn github(&self, base_url: &str, token: &AuthToken) -> GitHubClient {
        GitHubClient::new(&self.clients(base_url, token))
    }

    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write test file");
        path
    }
}

/// Mock GitHub repository data for testing
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct MockRepository {
    pub name: String,
    pub owner: String,
    pub is_fork: bool,
    pub language: Option<String>,
}

#[allow(dead_code)]
impl MockRepository {
    pub fn new(name: &str, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            is_fork: false,
            language: None,
        }
    }

    pub fn as_fork(mut self) -> Self {
        self.is_fork = true;
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// JSON object shaped like the GitHub API response element
    pub fn to_json(&self) -> Value {
        json!({
            "id": 1,
            "node_id": "MDEwOlJlcG9zaXRvcnkx",
            "name": self.name,
            "full_name": format!("{}/{}", self.owner, self.name),
            "private": false,
            "owner": { "login": self.owner, "type": "User" },
            "html_url": format!("https://github.com/{}/{}", self.owner, self.name),
            "description": null,
            "fork": self.is_fork,
            "language": self.language,
            "stargazers_count": 0,
            "updated_at": "2024-05-01T12:00:00Z"
        })
    }
}

#[allow(dead_code)]
pub fn repos_body(repos: &[MockRepository]) -> Value {
    Value::Array(repos.iter().map(MockRepository::to_json).collect())
}
