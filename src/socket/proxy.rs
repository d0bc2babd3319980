use std::net::IpAddr;
use url::Url;
use zeroize::Zeroizing;

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// Plain HTTP proxy, requests sent in absolute form.
    Http,
    /// HTTPS proxy (TLS to proxy)
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy configuration with bypass rules.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password (zeroized on drop)
    pub password: Option<Zeroizing<String>>,
    /// NO_PROXY entries, lowercased.
    bypass: Vec<String>,
}

impl ProxySettings {
    /// Create proxy settings from URL string.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        url.host_str()?;
        Some(Self {
            url,
            username: None,
            password: None,
            bypass: Vec::new(),
        })
    }

    /// Create proxy from environment variables.
    ///
    /// Checks `HTTP_PROXY`/`http_proxy` then `HTTPS_PROXY`/`https_proxy`, with
    /// bypass rules from `NO_PROXY`/`no_proxy`.
    pub fn from_env() -> Option<Self> {
        let url_str = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .or_else(|_| std::env::var("HTTPS_PROXY"))
            .or_else(|_| std::env::var("https_proxy"))
            .ok()?;
        let no_proxy = std::env::var("NO_PROXY")
            .or_else(|_| std::env::var("no_proxy"))
            .unwrap_or_default();

        Some(Self::new(&url_str)?.with_bypass(&no_proxy))
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Add bypass rules from a NO_PROXY string.
    ///
    /// Comma-separated hosts, domain suffixes (optional leading dot),
    /// IP addresses, or `*` for everything.
    pub fn with_bypass(mut self, no_proxy: &str) -> Self {
        self.bypass = no_proxy
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Get proxy type from URL scheme.
    pub fn proxy_type(&self) -> ProxyType {
        match self.url.scheme() {
            "https" => ProxyType::Https,
            "socks5" | "socks5h" | "socks4" | "socks4a" => ProxyType::Socks5,
            _ => ProxyType::Http,
        }
    }

    /// Check if URL should bypass this proxy.
    pub fn should_bypass(&self, target: &Url) -> bool {
        let Some(host) = target.host_str() else {
            return false;
        };
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_lowercase();
        let host_ip = host.parse::<IpAddr>().ok();

        self.bypass.iter().any(|rule| {
            if rule == "*" {
                return true;
            }
            if let (Some(ip), Ok(rule_ip)) = (host_ip, rule.parse::<IpAddr>()) {
                return ip == rule_ip;
            }
            let domain = rule.strip_prefix('.').unwrap_or(rule);
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }

    /// Get `Proxy-Authorization` header value for HTTP proxies.
    pub fn get_auth_header(&self) -> Option<Zeroizing<String>> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            use base64::{engine::general_purpose, Engine as _};
            let creds = Zeroizing::new(format!("{}:{}", u, p.as_str()));
            let encoded = general_purpose::STANDARD.encode(creds.as_bytes());
            Some(Zeroizing::new(format!("Basic {}", encoded)))
        } else {
            None
        }
    }

    /// Check if this proxy requires authentication.
    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Get proxy host and port.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let host = self.url.host_str()?;
        let port = self.url.port().unwrap_or(match self.proxy_type() {
            ProxyType::Http => 80,
            ProxyType::Https => 443,
            ProxyType::Socks5 => 1080,
        });
        Some((host, port))
    }
}
