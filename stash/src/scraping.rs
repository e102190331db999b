//! Page fetching: a single browser-like GET per link, guarded by a URL policy.

use async_trait::async_trait;
use common::FetchConfig;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect;
use reqwest::Client;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::{Host, Url};

/// Desktop Chrome identification; some sites refuse non-browser clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 5;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("URL blocked by fetch policy: {0}")]
    Blocked(String),
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
}

/// Parse a client-supplied string into an absolute URL with a host.
pub fn parse_target(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.host().is_none() {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL has no host".to_string(),
        });
    }
    Ok(url)
}

/// Which targets the fetcher is allowed to contact.
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    allowed_schemes: Vec<String>,
    block_private_networks: bool,
    /// Hosts exempt from the address checks (an internal wiki, say).
    allowed_hosts: HashSet<String>,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            block_private_networks: true,
            allowed_hosts: HashSet::new(),
        }
    }
}

impl UrlPolicy {
    pub fn new(allowed_schemes: Vec<String>, block_private_networks: bool) -> Self {
        Self {
            allowed_schemes: allowed_schemes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            block_private_networks,
            allowed_hosts: HashSet::new(),
        }
    }

    /// http/https only, but internal addresses are reachable (local development, tests).
    pub fn allow_private() -> Self {
        Self {
            block_private_networks: false,
            ..Self::default()
        }
    }

    /// Exempt `host` from the address checks. The scheme check still applies.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(normalize_host(&host.into()));
        self
    }

    pub fn from_config(cfg: &FetchConfig) -> Self {
        let defaults = Self::default();
        let mut policy = Self::new(
            cfg.allowed_schemes
                .clone()
                .unwrap_or(defaults.allowed_schemes),
            cfg.block_private_networks
                .unwrap_or(defaults.block_private_networks),
        );
        for host in cfg.allowed_hosts.iter().flatten() {
            policy = policy.allow_host(host.as_str());
        }
        policy
    }

    /// Whether addresses for `host` must be public.
    fn guards(&self, host: &str) -> bool {
        self.block_private_networks && !self.allowed_hosts.contains(&normalize_host(host))
    }

    /// Checks that need no I/O: scheme, IP literals and `localhost`.
    ///
    /// Domain names are checked again at connect time by the fetcher's
    /// resolver, for the first request and every redirect hop.
    pub fn check(&self, url: &Url) -> Result<(), FetchError> {
        if !self.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(FetchError::Blocked(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }
        let Some(host) = url.host_str() else {
            return Err(FetchError::Blocked("URL has no host".to_string()));
        };
        if !self.guards(host) {
            return Ok(());
        }
        match url.host() {
            Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
            Some(Host::Domain(name)) => {
                let name = normalize_host(name);
                if name == "localhost" || name.ends_with(".localhost") {
                    Err(FetchError::Blocked(format!("host '{}' is local", name)))
                } else {
                    Ok(())
                }
            }
            None => Err(FetchError::Blocked("URL has no host".to_string())),
        }
    }

    /// Addresses `host` resolved to, or the reason they may not be contacted.
    pub fn check_resolved(&self, host: &str, addrs: &[SocketAddr]) -> Result<(), FetchError> {
        if !self.guards(host) {
            return Ok(());
        }
        if addrs.is_empty() {
            return Err(FetchError::Blocked(format!("host '{}' has no addresses", host)));
        }
        match addrs.iter().find(|a| !is_public_ip(a.ip())) {
            Some(internal) => Err(FetchError::Blocked(format!(
                "host '{}' resolves to non-public address {}",
                host,
                internal.ip()
            ))),
            None => Ok(()),
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn check_ip(ip: IpAddr) -> Result<(), FetchError> {
    if is_public_ip(ip) {
        Ok(())
    } else {
        Err(FetchError::Blocked(format!("address {} is not public", ip)))
    }
}

/// True for addresses routable on the public internet.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (64..128).contains(&b); // 100.64.0.0/10
    let this_network = a == 0;
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || this_network)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00; // fc00::/7
    let link_local = (first & 0xffc0) == 0xfe80; // fe80::/10
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local)
}

/// Raised inside reqwest (resolver, redirect policy) and mapped back to
/// [`FetchError::Blocked`].
#[derive(Debug, Error)]
#[error("{0}")]
struct PolicyViolation(String);

/// Host lookup through the system resolver.
struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Resolves through `upstream`, then applies the policy to the addresses
/// reqwest is about to connect to.
struct PolicyResolver {
    policy: UrlPolicy,
    upstream: Arc<dyn Resolve>,
}

impl Resolve for PolicyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let policy = self.policy.clone();
        let pending = self.upstream.resolve(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = pending.await?.collect();
            if let Err(e) = policy.check_resolved(&host, &addrs) {
                let reason = match e {
                    FetchError::Blocked(reason) => reason,
                    other => other.to_string(),
                };
                debug!("refusing connection: {}", reason);
                return Err(Box::new(PolicyViolation(reason)) as BoxError);
            }
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Retrieves raw HTML for a URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError>;
}

/// Options for [`HttpFetcher`].
#[derive(Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_response_bytes: Option<u64>,
    pub policy: UrlPolicy,
    /// Name resolution ahead of the policy; the system resolver when unset.
    pub resolver: Option<Arc<dyn Resolve>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: BROWSER_USER_AGENT.to_string(),
            max_response_bytes: None,
            policy: UrlPolicy::default(),
            resolver: None,
        }
    }
}

impl FetchOptions {
    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            user_agent: cfg
                .user_agent
                .clone()
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
            max_response_bytes: cfg.max_response_bytes,
            policy: UrlPolicy::from_config(cfg),
            resolver: None,
        }
    }
}

/// reqwest-backed fetcher. One request per call, no retries.
pub struct HttpFetcher {
    client: Client,
    policy: UrlPolicy,
    max_response_bytes: Option<u64>,
}

impl HttpFetcher {
    pub fn new(options: FetchOptions) -> anyhow::Result<Self> {
        let hop_policy = options.policy.clone();
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("more than {} redirects", MAX_REDIRECTS));
            }
            match hop_policy.check(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(FetchError::Blocked(reason)) => attempt.error(PolicyViolation(reason)),
                Err(e) => attempt.error(e.to_string()),
            }
        });

        let resolver = PolicyResolver {
            policy: options.policy.clone(),
            upstream: options
                .resolver
                .unwrap_or_else(|| Arc::new(SystemResolver)),
        };

        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent)
            .redirect(redirect_policy)
            .dns_resolver(Arc::new(resolver))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;

        Ok(Self {
            client,
            policy: options.policy,
            max_response_bytes: options.max_response_bytes,
        })
    }

    async fn read_body(
        &self,
        url: &Url,
        mut response: reqwest::Response,
    ) -> Result<String, FetchError> {
        let Some(limit) = self.max_response_bytes else {
            return response
                .text()
                .await
                .map_err(|e| transport_error(url, e));
        };

        if response.content_length().map_or(false, |len| len > limit) {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }

        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_error(url, e))?
        {
            if bytes.len() as u64 + chunk.len() as u64 > limit {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn policy_violation(e: &reqwest::Error) -> Option<&PolicyViolation> {
    let mut source = StdError::source(e);
    while let Some(err) = source {
        if let Some(violation) = err.downcast_ref::<PolicyViolation>() {
            return Some(violation);
        }
        source = err.source();
    }
    None
}

fn transport_error(url: &Url, e: reqwest::Error) -> FetchError {
    if let Some(violation) = policy_violation(&e) {
        return FetchError::Blocked(violation.0.clone());
    }
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            source: e,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        self.policy.check(url)?;
        debug!("fetching {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let html = self.read_body(url, response).await?;
        info!("scraping: fetched {} bytes from {}", html.len(), url);
        Ok(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn public_and_internal_addresses() {
        assert!(is_public_ip("93.184.216.34".parse().unwrap()));
        assert!(is_public_ip("2606:4700::1111".parse().unwrap()));

        for internal in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(!is_public_ip(internal.parse().unwrap()), "{}", internal);
        }
    }

    #[test]
    fn default_policy_rejects_internal_targets() {
        let policy = UrlPolicy::default();
        assert!(policy.check(&url("https://example.com/a")).is_ok());
        assert!(policy.check(&url("http://93.184.216.34/")).is_ok());

        for blocked in [
            "ftp://example.com/file",
            "file:///etc/passwd",
            "http://127.0.0.1:8080/",
            "http://localhost/admin",
            "http://api.localhost/",
            "http://[::1]/",
            "http://169.254.169.254/latest/meta-data",
        ] {
            assert!(
                matches!(policy.check(&url(blocked)), Err(FetchError::Blocked(_))),
                "{}",
                blocked
            );
        }
    }

    #[test]
    fn allow_private_still_limits_schemes() {
        let policy = UrlPolicy::allow_private();
        assert!(policy.check(&url("http://127.0.0.1:1234/")).is_ok());
        assert!(policy.check(&url("gopher://127.0.0.1/")).is_err());
    }

    #[test]
    fn policy_from_config() {
        let cfg = FetchConfig {
            allowed_schemes: Some(vec!["HTTPS".to_string()]),
            block_private_networks: Some(false),
            ..FetchConfig::default()
        };
        let policy = UrlPolicy::from_config(&cfg);
        assert!(policy.check(&url("https://10.0.0.1/")).is_ok());
        assert!(policy.check(&url("http://example.com/")).is_err());

        let cfg = FetchConfig {
            allowed_hosts: Some(vec!["wiki.corp.example".to_string()]),
            ..FetchConfig::default()
        };
        let policy = UrlPolicy::from_config(&cfg);
        assert!(policy
            .check_resolved("wiki.corp.example", &addrs(&["10.1.1.1"]))
            .is_ok());
        assert!(policy.check(&url("http://10.1.1.1/")).is_err());
    }

    #[test]
    fn parse_target_requires_absolute_url() {
        assert!(parse_target("https://example.com/post").is_ok());
        assert!(matches!(
            parse_target("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_target("/relative/path"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_target("mailto:someone@example.com"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn blocked_literal_names_the_address() {
        let policy = UrlPolicy::default();
        let err = policy.check(&url("http://192.168.0.10/")).unwrap_err();
        assert!(err.to_string().contains("192.168.0.10"));
    }

    fn addrs(ips: &[&str]) -> Vec<SocketAddr> {
        ips.iter()
            .map(|ip| SocketAddr::new(ip.parse().unwrap(), 0))
            .collect()
    }

    #[test]
    fn resolved_addresses_must_all_be_public() {
        let policy = UrlPolicy::default();
        assert!(policy
            .check_resolved("example.com", &addrs(&["93.184.216.34"]))
            .is_ok());
        assert!(matches!(
            policy.check_resolved("intranet.corp.example", &addrs(&["10.0.0.7"])),
            Err(FetchError::Blocked(_))
        ));
        assert!(matches!(
            policy.check_resolved("rebind.example", &addrs(&["93.184.216.34", "127.0.0.1"])),
            Err(FetchError::Blocked(_))
        ));
        assert!(policy.check_resolved("empty.example", &[]).is_err());
    }

    #[test]
    fn allowed_hosts_skip_address_checks() {
        let policy = UrlPolicy::default().allow_host("Wiki.Corp.Example.");
        assert!(policy
            .check_resolved("wiki.corp.example", &addrs(&["10.0.0.8"]))
            .is_ok());
        assert!(policy.check(&url("http://wiki.corp.example/page")).is_ok());
        assert!(policy.check(&url("ftp://wiki.corp.example/page")).is_err());
        assert!(policy
            .check_resolved("other.corp.example", &addrs(&["10.0.0.8"]))
            .is_err());
    }

    #[test]
    fn allow_private_ignores_resolved_addresses() {
        let policy = UrlPolicy::allow_private();
        assert!(policy
            .check_resolved("db.internal", &addrs(&["192.168.1.20"]))
            .is_ok());
    }
}
