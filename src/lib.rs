//! repolist - GitHub repository lister
//!
//! Lists a GitHub user's repositories through one of two HTTP client
//! profiles built from a single configuration.
//!
//! ## Modules
//!
//! - [`config`]: Configuration file and the persisted preferences store
//! - [`auth`]: API token and the authenticating request interceptor
//! - [`tls`]: TLS 1.2 compatibility for legacy platforms
//! - [`cache`]: Bounded on-disk response cache
//! - [`http`]: The `cached` and `non_cached` client profiles
//! - [`github`]: Typed binding for `GET /users/{user}/repos`
//! - [`app`]: Explicitly constructed process-wide state

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod github;
pub mod http;
pub mod tls;

pub use app::AppContext;
pub use auth::AuthToken;
pub use config::{Config, Preferences};
pub use github::{GitHubClient, ListError, Repository, RepositoryListResult};
pub use http::{ClientConfig, ClientFactory, Clients, HttpClient};
