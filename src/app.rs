//! Process-wide state
//!
//! [`AppContext::init`] builds the two HTTP client profiles and the GitHub
//! binding once at startup. Consumers share the context through an `Arc`
//! and [`AppContext::shutdown`] tears it down before the process exits.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::AuthToken;
use crate::config::{Config, Preferences};
use crate::github::GitHubClient;
use crate::http::{ClientFactory, Clients, HttpClient};

#[derive(Debug)]
pub struct AppContext {
    config: Config,
    clients: Clients,
    github: GitHubClient,
}

impl AppContext {
    /// Read the token from `prefs` and build every client described by `config`
    pub fn init(config: Config, prefs: &Preferences) -> Result<Arc<Self>> {
        let token = AuthToken::from_store(prefs);
        Self::with_token(config, &token)
    }

    pub fn with_token(config: Config, token: &AuthToken) -> Result<Arc<Self>> {
        let client_config = config.client_config()?;
        let clients = ClientFactory::build(&client_config, token)?;
        let github = GitHubClient::new(&clients);

        debug!("Application context initialized");

        Ok(Arc::new(Self {
            config,
            clients,
            github,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn github(&self) -> &GitHubClient {
        &self.github
    }

    pub fn cached_client(&self) -> &HttpClient {
        &self.clients.cached
    }

    pub fn non_cached_client(&self) -> &HttpClient {
        &self.clients.non_cached
    }

    /// Release the clients, warning if other handles still hold the context
    pub fn shutdown(self: Arc<Self>) {
        match Arc::try_unwrap(self) {
            Ok(context) => {
                drop(context);
                info!("Application context shut down");
            }
            Err(shared) => {
                warn!(
                    "Shutting down with {} outstanding context handles",
                    Arc::strong_count(&shared) - 1
                );
            }
        }
    }
}
