//! HTTP client profiles
//!
//! Two clients are built from one [`ClientConfig`]:
//!
//! - `cached`: on-disk response cache.
//! - `non_cached`: no cache, goes through the [`TlsShim`].
//!
//! Both follow redirects (including http to https), retry once when a
//! connection cannot be established, and share the same timeouts,
//! request/response logging and optional authentication.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{redirect, ClientBuilder, Method, StatusCode, Url};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthToken, AuthenticationInterceptor, RequestInterceptor};
use crate::cache::{CacheControl, CachedResponse, ResponseCache};
use crate::config::{Config, TlsConfig};
use crate::tls::TlsShim;

/// Settings shared by both client profiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub cache_enabled: bool,
    pub cache_size_bytes: u64,
    pub cache_dir: PathBuf,
    pub log_body: bool,
    pub user_agent: String,
    pub max_redirects: usize,
    pub retry_on_connection_failure: bool,
    pub tls: TlsConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_enabled && self.cache_size_bytes == 0 {
            bail!("cache_size_bytes must be greater than zero when the cache is enabled");
        }

        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("write_timeout", self.write_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if timeout.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }

        self.parsed_base_url()?;
        Ok(())
    }

    /// Base URL parsed and checked for an http(s) scheme
    pub fn parsed_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(anyhow!("Unsupported base URL scheme: {}", other)),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let config = Config::default();

        Self {
            base_url: config.api.base_url,
            connect_timeout: Duration::from_secs(config.http.connect_timeout),
            write_timeout: Duration::from_secs(config.http.write_timeout),
            read_timeout: Duration::from_secs(config.http.read_timeout),
            cache_enabled: config.http.cache_enabled,
            cache_size_bytes: config.http.cache_size_bytes,
            cache_dir: PathBuf::from(config.http.cache_dir),
            log_body: config.http.log_body,
            user_agent: config.http.user_agent,
            max_redirects: config.http.max_redirects,
            retry_on_connection_failure: config.http.retry_on_connection_failure,
            tls: config.tls,
        }
    }
}

/// Which of the two client profiles a client was built as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Cached,
    NonCached,
}

impl ClientKind {
    pub fn name(self) -> &'static str {
        match self {
            ClientKind::Cached => "cached",
            ClientKind::NonCached => "non_cached",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure to obtain any response from the server
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("no response within {0:?}")]
    SendTimeout(Duration),
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        match self {
            HttpError::Transport(e) => e.is_timeout(),
            HttpError::SendTimeout(_) => true,
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, HttpError::Transport(e) if e.is_connect())
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: String,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

impl HttpResponse {
    fn from_cache(entry: &CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        let stored = [
            (CONTENT_TYPE, &entry.content_type),
            (ETAG, &entry.etag),
            (LAST_MODIFIED, &entry.last_modified),
        ];
        for (name, value) in stored {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }

        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers,
            url: entry.url.clone(),
            body: entry.body.clone(),
            from_cache: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A configured HTTP client with its interceptor chain and optional cache
pub struct HttpClient {
    kind: ClientKind,
    inner: reqwest::Client,
    base_url: Url,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    cache: Option<ResponseCache>,
    log_body: bool,
    send_timeout: Duration,
    retry_on_connection_failure: bool,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url.as_str())
            .field("interceptors", &self.interceptor_ids())
            .field("cache", &self.cache.as_ref().map(|c| c.directory()))
            .finish()
    }
}

impl HttpClient {
    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn retries_on_connection_failure(&self) -> bool {
        self.retry_on_connection_failure
    }

    pub fn interceptor_ids(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.id()).collect()
    }

    pub fn has_interceptor(&self, id: &str) -> bool {
        self.interceptors.iter().any(|i| i.id() == id)
    }

    /// Add `interceptor` unless one with the same id is already installed
    pub fn install_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) -> bool {
        if self.has_interceptor(interceptor.id()) {
            debug!(
                "Interceptor '{}' already installed on {} client",
                interceptor.id(),
                self.kind
            );
            return false;
        }

        self.interceptors.push(interceptor);
        true
    }

    /// Install the authentication interceptor if `token` is present
    pub fn authenticate(&mut self, token: &AuthToken) -> Result<bool> {
        if !token.is_present() || self.has_interceptor(AuthenticationInterceptor::ID) {
            return Ok(false);
        }

        let interceptor = AuthenticationInterceptor::new(token)?;
        let installed = self.install_interceptor(Arc::new(interceptor));
        if installed {
            debug!("Authentication enabled on {} client", self.kind);
        }
        Ok(installed)
    }

    /// Base URL extended with `segments`, each percent-encoded as one path segment
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn get(&self, url: Url) -> reqwest::Request {
        reqwest::Request::new(Method::GET, url)
    }

    /// Run `request` through the interceptors, the cache and the network
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<HttpResponse, HttpError> {
        for interceptor in &self.interceptors {
            interceptor.intercept(&mut request);
        }

        let cache = self
            .cache
            .as_ref()
            .filter(|_| *request.method() == Method::GET);
        let cache_key = request.url().to_string();

        let cached = match cache {
            Some(cache) => cache.get(&cache_key).await,
            None => None,
        };

        if let Some(entry) = &cached {
            if entry.is_fresh(Utc::now()) {
                debug!("<-- cache hit {}", cache_key);
                return Ok(HttpResponse::from_cache(entry));
            }
            add_validators(&mut request, entry);
        }

        self.log_request(&request);
        let started = Instant::now();

        let response = self.send_with_retry(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let body = response.bytes().await?.to_vec();

        debug!(
            "<-- {} {} ({}ms, {}-byte body)",
            status.as_u16(),
            url,
            started.elapsed().as_millis(),
            body.len()
        );
        if self.log_body && !body.is_empty() {
            trace!("{}", String::from_utf8_lossy(&body));
        }

        if let Some(cache) = cache {
            if status == StatusCode::NOT_MODIFIED {
                if let Some(mut entry) = cached {
                    debug!("<-- revalidated {}", cache_key);
                    refresh_entry(&mut entry, &headers);
                    if let Err(e) = cache.put(&entry).await {
                        warn!("Failed to refresh cache entry for {}: {}", cache_key, e);
                    }
                    return Ok(HttpResponse::from_cache(&entry));
                }
            } else if status.is_success() {
                store_response(cache, &cache_key, status, &headers, &body).await;
            }
        }

        Ok(HttpResponse {
            status,
            headers,
            url,
            body,
            from_cache: false,
        })
    }

    async fn send_with_retry(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, HttpError> {
        let retry = if self.retry_on_connection_failure {
            request.try_clone()
        } else {
            None
        };

        match self.send(request).await {
            Err(e) if e.is_connect() => match retry {
                Some(retry) => {
                    warn!("Connection to {} failed ({}), retrying", retry.url(), e);
                    self.send(retry).await
                }
                None => Err(e),
            },
            other => other,
        }
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, HttpError> {
        match tokio::time::timeout(self.send_timeout, self.inner.execute(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HttpError::SendTimeout(self.send_timeout)),
        }
    }

    fn log_request(&self, request: &reqwest::Request) {
        debug!("--> {} {} ({})", request.method(), request.url(), self.kind);

        for (name, value) in request.headers() {
            if name == AUTHORIZATION || value.is_sensitive() {
                trace!("{}: ██", name);
            } else {
                trace!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }

        if self.log_body {
            if let Some(body) = request.body().and_then(|b| b.as_bytes()) {
                trace!("{}", String::from_utf8_lossy(body));
            }
        }
    }
}

fn add_validators(request: &mut reqwest::Request, entry: &CachedResponse) {
    let headers = request.headers_mut();

    if let Some(value) = entry.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(IF_NONE_MATCH, value);
    }
    if let Some(value) = entry
        .last_modified
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, value);
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn refresh_entry(entry: &mut CachedResponse, headers: &HeaderMap) {
    entry.stored_at = Utc::now();

    if let Some(value) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let directives = CacheControl::parse(value);
        entry.max_age = directives.max_age;
        entry.must_revalidate = directives.no_cache;
    }
    if let Some(etag) = header_string(headers, ETAG) {
        entry.etag = Some(etag);
    }
    if let Some(last_modified) = header_string(headers, LAST_MODIFIED) {
        entry.last_modified = Some(last_modified);
    }
}

async fn store_response(
    cache: &ResponseCache,
    url: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) {
    let directives = headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(CacheControl::parse)
        .unwrap_or_default();

    if directives.no_store {
        cache.remove(url).await;
        return;
    }

    let entry = CachedResponse {
        url: url.to_string(),
        status: status.as_u16(),
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
        content_type: header_string(headers, CONTENT_TYPE),
        stored_at: Utc::now(),
        max_age: directives.max_age,
        must_revalidate: directives.no_cache,
        body: body.to_vec(),
    };

    // Nothing to serve fresh and nothing to revalidate with
    if entry.max_age.is_none() && !entry.can_revalidate() {
        return;
    }

    if let Err(e) = cache.put(&entry).await {
        warn!("Failed to cache response for {}: {}", url, e);
    }
}

/// The two process-wide client profiles
#[derive(Debug, Clone)]
pub struct Clients {
    pub cached: Arc<HttpClient>,
    pub non_cached: Arc<HttpClient>,
}

/// Builds [`HttpClient`]s from a [`ClientConfig`]
pub struct ClientFactory;

impl ClientFactory {
    /// Build both profiles; authentication is installed iff `token` is present
    pub fn build(config: &ClientConfig, token: &AuthToken) -> Result<Clients> {
        let cached = Self::cached(config, token)?;
        let non_cached = Self::non_cached(config, token)?;

        info!(
            "HTTP clients ready for {} (cache: {}, auth: {})",
            config.base_url,
            if cached.cache.is_some() { "on" } else { "off" },
            if token.is_present() { "token" } else { "anonymous" }
        );

        Ok(Clients {
            cached: Arc::new(cached),
            non_cached: Arc::new(non_cached),
        })
    }

    pub fn cached(config: &ClientConfig, token: &AuthToken) -> Result<HttpClient> {
        config.validate()?;

        let inner = Self::base_builder(config)
            .build()
            .context("Failed to build cached HTTP client")?;

        let cache = if config.cache_enabled {
            Some(ResponseCache::open(&config.cache_dir, config.cache_size_bytes)?)
        } else {
            None
        };

        let mut client = Self::assemble(ClientKind::Cached, inner, config, cache)?;
        client.authenticate(token)?;
        Ok(client)
    }

    pub fn non_cached(config: &ClientConfig, token: &AuthToken) -> Result<HttpClient> {
        Self::non_cached_with_shim(config, token, TlsShim::for_current_platform(&config.tls))
    }

    pub fn non_cached_with_shim(
        config: &ClientConfig,
        token: &AuthToken,
        shim: TlsShim,
    ) -> Result<HttpClient> {
        config.validate()?;

        let inner = shim
            .apply(Self::base_builder(config))
            .build()
            .context("Failed to build non-cached HTTP client")?;

        let mut client = Self::assemble(ClientKind::NonCached, inner, config, None)?;
        client.authenticate(token)?;
        Ok(client)
    }

    // Policy::limited also follows http -> https upgrades
    fn base_builder(config: &ClientConfig) -> ClientBuilder {
        reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
    }

    fn assemble(
        kind: ClientKind,
        inner: reqwest::Client,
        config: &ClientConfig,
        cache: Option<ResponseCache>,
    ) -> Result<HttpClient> {
        Ok(HttpClient {
            kind,
            inner,
            base_url: config.parsed_base_url()?,
            interceptors: Vec::new(),
            cache,
            log_body: config.log_body,
            send_timeout: config.write_timeout + config.read_timeout,
            retry_on_connection_failure: config.retry_on_connection_failure,
        })
    }
}
