//! TLS 1.2 compatibility for platforms whose default TLS stack predates it.
//!
//! Android API levels 16 through 21 ship TLS 1.2 but do not enable it by
//! default. On those devices the non-cached client makes sure TLS 1.2 is
//! enabled, still accepts TLS 1.0/1.1 servers as the compatible fallback, and
//! refuses plain HTTP unless configured otherwise. Everywhere else the shim
//! leaves the client builder untouched.

use reqwest::tls::Version;
use reqwest::ClientBuilder;
use std::ops::RangeInclusive;
use tracing::{debug, error, info};

use crate::config::TlsConfig;

/// Android API levels whose TLS defaults are deficient
pub const LEGACY_ANDROID_API_LEVELS: RangeInclusive<u32> = 16..=21;

/// Lowest protocol an active shim negotiates; TLS 1.2 and newer stay enabled
pub const COMPATIBLE_TLS_FLOOR: Version = Version::TLS_1_0;

/// Runtime platform as far as TLS defaults are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android { api_level: u32 },
    Other,
}

impl Platform {
    /// Detect the platform the process is running on
    pub fn detect() -> Self {
        match android_api_level() {
            Some(api_level) => Platform::Android { api_level },
            None => Platform::Other,
        }
    }

    pub fn has_legacy_tls(&self) -> bool {
        match self {
            Platform::Android { api_level } => LEGACY_ANDROID_API_LEVELS.contains(api_level),
            Platform::Other => false,
        }
    }
}

#[cfg(target_os = "android")]
fn android_api_level() -> Option<u32> {
    let output = std::process::Command::new("getprop")
        .arg("ro.build.version.sdk")
        .output()
        .ok()?;

    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(target_os = "android"))]
fn android_api_level() -> Option<u32> {
    None
}

/// Decides whether TLS 1.2 is forced and applies that to a client builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsShim {
    active: bool,
    allow_cleartext: bool,
}

impl TlsShim {
    pub fn new(config: &TlsConfig, platform: Platform) -> Self {
        let active = config
            .force_tls12
            .unwrap_or_else(|| platform.has_legacy_tls());

        Self {
            active,
            allow_cleartext: config.allow_cleartext,
        }
    }

    pub fn for_current_platform(config: &TlsConfig) -> Self {
        let platform = Platform::detect();
        debug!("Detected platform: {:?}", platform);
        Self::new(config, platform)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn allows_cleartext(&self) -> bool {
        self.allow_cleartext
    }

    /// Minimum protocol version set on the builder, if any
    pub fn min_tls_version(&self) -> Option<Version> {
        self.active.then_some(COMPATIBLE_TLS_FLOOR)
    }

    /// Apply the TLS policy to `builder`
    ///
    /// If a TLS 1.2 context cannot be created the failure is logged and the
    /// builder is returned with the platform defaults.
    pub fn apply(&self, builder: ClientBuilder) -> ClientBuilder {
        if !self.active {
            return builder;
        }

        if let Err(e) = probe_tls12_context() {
            error!("Error while setting TLS 1.2, using platform defaults: {}", e);
            return builder;
        }

        info!(
            "Enabling TLS 1.2 with TLS 1.0 fallback (cleartext {})",
            if self.allow_cleartext { "allowed" } else { "refused" }
        );

        builder
            .min_tls_version(COMPATIBLE_TLS_FLOOR)
            .https_only(!self.allow_cleartext)
    }
}

fn probe_tls12_context() -> Result<(), reqwest::Error> {
    reqwest::Client::builder()
        .min_tls_version(Version::TLS_1_2)
        .build()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_api_levels() {
        assert!(!Platform::Android { api_level: 15 }.has_legacy_tls());
        assert!(Platform::Android { api_level: 16 }.has_legacy_tls());
        assert!(Platform::Android { api_level: 21 }.has_legacy_tls());
        assert!(!Platform::Android { api_level: 22 }.has_legacy_tls());
        assert!(!Platform::Other.has_legacy_tls());
    }

    #[test]
    fn test_shim_follows_platform_by_default() {
        let config = TlsConfig::default();

        assert!(TlsShim::new(&config, Platform::Android { api_level: 19 }).is_active());
        assert!(!TlsShim::new(&config, Platform::Android { api_level: 28 }).is_active());
        assert!(!TlsShim::new(&config, Platform::Other).is_active());
    }

    #[test]
    fn test_config_overrides_detection() {
        let forced = TlsConfig {
            force_tls12: Some(true),
            allow_cleartext: false,
        };
        assert!(TlsShim::new(&forced, Platform::Other).is_active());

        let disabled = TlsConfig {
            force_tls12: Some(false),
            allow_cleartext: false,
        };
        assert!(!TlsShim::new(&disabled, Platform::Android { api_level: 17 }).is_active());
    }

    #[test]
    fn test_active_shim_keeps_compatible_floor() {
        let forced = TlsConfig {
            force_tls12: Some(true),
            allow_cleartext: false,
        };
        let shim = TlsShim::new(&forced, Platform::Android { api_level: 19 });

        assert_eq!(shim.min_tls_version(), Some(Version::TLS_1_0));

        let inactive = TlsShim::new(&TlsConfig::default(), Platform::Other);
        assert_eq!(inactive.min_tls_version(), None);
    }

    #[test]
    fn test_inactive_shim_builds_default_client() {
        let shim = TlsShim::new(&TlsConfig::default(), Platform::Other);
        assert!(shim.apply(reqwest::Client::builder()).build().is_ok());
    }

    #[test]
    fn test_active_shim_builds_client() {
        let config = TlsConfig {
            force_tls12: Some(true),
            allow_cleartext: true,
        };
        let shim = TlsShim::new(&config, Platform::Other);

        assert!(shim.allows_cleartext());
        assert!(shim.apply(reqwest::Client::builder()).build().is_ok());
    }

    #[cfg(not(target_os = "android"))]
    #[test]
    fn test_detect_off_android() {
        assert_eq!(Platform::detect(), Platform::Other);
    }
}
