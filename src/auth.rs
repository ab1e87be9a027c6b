use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use std::env;
use std::fmt;
use tracing::{debug, warn};

use crate::config::{Preferences, API_KEY};

/// Environment variable that overrides the stored token
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

/// Credential used to authenticate API requests
///
/// A token is `present` when the store holds the key at all, even if the
/// stored value is empty.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AuthToken {
    value: String,
    present: bool,
}

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into().trim().to_string(),
            present: true,
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }

    /// Read the token from the environment or the preferences store
    pub fn from_store(prefs: &Preferences) -> Self {
        if let Some(token) = Self::try_environment_token() {
            return token;
        }

        match prefs.get_string(API_KEY) {
            Some(value) => {
                debug!("Using token from preferences store");
                Self::new(value)
            }
            None => {
                debug!("No API token configured, requests will be anonymous");
                Self::absent()
            }
        }
    }

    fn try_environment_token() -> Option<Self> {
        let token = env::var(TOKEN_ENV_VAR).ok()?;

        if token.trim().is_empty() {
            return None;
        }

        if !token.starts_with("ghp_")
            && !token.starts_with("gho_")
            && !token.starts_with("ghs_")
            && !token.starts_with("github_pat_")
        {
            warn!("{} doesn't look like a valid GitHub token", TOKEN_ENV_VAR);
        }

        debug!("Using token from {}", TOKEN_ENV_VAR);
        Some(Self::new(token))
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("present", &self.present)
            .finish()
    }
}

/// Hook applied to every outgoing request of an [`HttpClient`](crate::http::HttpClient)
pub trait RequestInterceptor: Send + Sync {
    /// Stable identifier; a client holds at most one interceptor per id
    fn id(&self) -> &'static str;

    fn intercept(&self, request: &mut reqwest::Request);
}

/// Sets `Authorization: token <value>` on outgoing requests
pub struct AuthenticationInterceptor {
    header: Option<HeaderValue>,
}

impl AuthenticationInterceptor {
    pub const ID: &'static str = "authentication";

    pub fn new(token: &AuthToken) -> Result<Self> {
        let header = if token.is_present() {
            let mut value = HeaderValue::from_str(&format!("token {}", token.value()))
                .context("API token contains characters not allowed in an HTTP header")?;
            value.set_sensitive(true);
            Some(value)
        } else {
            None
        };

        Ok(Self { header })
    }
}

impl RequestInterceptor for AuthenticationInterceptor {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn intercept(&self, request: &mut reqwest::Request) {
        if let Some(header) = &self.header {
            // insert replaces, so the header never appears twice
            request.headers_mut().insert(AUTHORIZATION, header.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::{Method, Url};
    use serial_test::serial;

    fn request() -> reqwest::Request {
        let url = Url::parse("https://api.github.com/users/octocat/repos").unwrap();
        reqwest::Request::new(Method::GET, url)
    }

    #[test]
    fn test_present_token_sets_header() {
        let interceptor = AuthenticationInterceptor::new(&AuthToken::new("abc123")).unwrap();
        let mut req = request();

        interceptor.intercept(&mut req);

        assert_eq!(req.headers()[AUTHORIZATION], "token abc123");
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_absent_token_passes_through() {
        let interceptor = AuthenticationInterceptor::new(&AuthToken::absent()).unwrap();
        let mut req = request();

        interceptor.intercept(&mut req);

        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_repeated_interception_keeps_single_header() {
        let interceptor = AuthenticationInterceptor::new(&AuthToken::new("abc123")).unwrap();
        let mut req = request();

        interceptor.intercept(&mut req);
        interceptor.intercept(&mut req);

        assert_eq!(req.headers().get_all(AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!(AuthenticationInterceptor::new(&AuthToken::new("bad\ntoken")).is_err());
    }

    #[test]
    fn test_debug_redacts_value() {
        let rendered = format!("{:?}", AuthToken::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("present: true"));
    }

    #[test]
    #[serial]
    fn test_from_store_prefers_environment() {
        let mut prefs = Preferences::in_memory();
        prefs.set_string(API_KEY, "from-prefs");

        env::set_var(TOKEN_ENV_VAR, "ghp_from_env");
        let token = AuthToken::from_store(&prefs);
        env::remove_var(TOKEN_ENV_VAR);

        assert_eq!(token.value(), "ghp_from_env");
    }

    #[test]
    #[serial]
    fn test_from_store_key_presence() {
        env::remove_var(TOKEN_ENV_VAR);

        let mut prefs = Preferences::in_memory();
        assert!(!AuthToken::from_store(&prefs).is_present());

        prefs.set_string(API_KEY, "");
        let token = AuthToken::from_store(&prefs);
        assert!(token.is_present());
        assert_eq!(token.value(), "");

        prefs.set_string(API_KEY, "  ghp_padded \n");
        assert_eq!(AuthToken::from_store(&prefs).value(), "ghp_padded");
    }
}
