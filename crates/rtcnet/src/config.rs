use std::env;
use std::fmt;
use std::time::Duration;

use tracing::Dispatch;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for [`crate::dial`].
#[derive(Clone)]
pub struct DialConfig {
    /// Connect to the signaling endpoint over `wss://` with this connector.
    pub tls: Option<native_tls::TlsConnector>,
    pub ordered: bool,
    pub ice_servers: Vec<String>,
    /// Bounds the whole dial, websocket connect included.
    pub timeout: Duration,
    pub logger: Option<Dispatch>,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            tls: None,
            ordered: true,
            ice_servers: Vec::new(),
            timeout: DEFAULT_DIAL_TIMEOUT,
            logger: None,
        }
    }
}

impl DialConfig {
    pub fn from_env() -> Self {
        let ordered = !env_flag("RTCNET_UNORDERED");
        let ice_servers = env_list("RTCNET_ICE_SERVERS");
        let timeout = env_millis("RTCNET_DIAL_TIMEOUT_MS").unwrap_or(DEFAULT_DIAL_TIMEOUT);
        Self {
            ordered,
            ice_servers,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, connector: native_tls::TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_ice_servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }
}

impl fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialConfig")
            .field("tls", &self.tls.is_some())
            .field("ordered", &self.ordered)
            .field("ice_servers", &self.ice_servers)
            .field("timeout", &self.timeout)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// Settings for [`crate::Listener`].
#[derive(Clone)]
pub struct ListenConfig {
    pub tls: Option<native_tls::TlsAcceptor>,
    /// Glob patterns (`*`, `?`) matched against the `Origin` host.
    pub origin_patterns: Vec<String>,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub logger: Option<Dispatch>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tls: None,
            origin_patterns: Vec::new(),
            ice_servers: Vec::new(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            logger: None,
        }
    }
}

impl ListenConfig {
    pub fn from_env() -> Self {
        let ice_servers = env_list("RTCNET_ICE_SERVERS");
        let negotiation_timeout =
            env_millis("RTCNET_NEGOTIATION_TIMEOUT_MS").unwrap_or(DEFAULT_NEGOTIATION_TIMEOUT);
        Self {
            ice_servers,
            negotiation_timeout,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, acceptor: native_tls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_origin_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origin_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ice_servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }
}

impl fmt::Debug for ListenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenConfig")
            .field("tls", &self.tls.is_some())
            .field("origin_patterns", &self.origin_patterns)
            .field("ice_servers", &self.ice_servers)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

fn env_flag(var: &str) -> bool {
    env::var(var)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_list(var: &str) -> Vec<String> {
    env::var(var)
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let dial = DialConfig::default();
        assert!(dial.ordered);
        assert!(dial.ice_servers.is_empty());
        assert_eq!(dial.timeout, Duration::from_secs(10));

        let listen = ListenConfig::default();
        assert_eq!(listen.negotiation_timeout, Duration::from_secs(30));
        assert!(listen.origin_patterns.is_empty());
    }

    #[test]
    fn ice_server_list_skips_blanks() {
        assert_eq!(
            parse_list(" stun:stun.l.google.com:19302, ,turn:example.org "),
            ["stun:stun.l.google.com:19302", "turn:example.org"]
        );
    }

    #[test]
    fn builders_replace_fields() {
        let dial = DialConfig::default()
            .with_ordered(false)
            .with_timeout(Duration::from_millis(250))
            .with_ice_servers(["stun:a"]);
        assert!(!dial.ordered);
        assert_eq!(dial.timeout, Duration::from_millis(250));
        assert_eq!(dial.ice_servers, ["stun:a"]);

        let listen = ListenConfig::default().with_origin_patterns(["*.example.com"]);
        assert_eq!(listen.origin_patterns, ["*.example.com"]);
    }
}
