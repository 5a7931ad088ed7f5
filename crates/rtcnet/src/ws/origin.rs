use glob::{MatchOptions, Pattern};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN};
use url::Url;

use crate::error::RtcError;

/// An allowed-origin glob, compiled once at bind time.
///
/// Patterns follow shell matching: `*`, `?` and `[...]` never cross a `/`,
/// `[^...]` negates a class and `\` escapes the next character. Matching
/// ignores case.
#[derive(Debug, Clone)]
pub(crate) struct OriginPattern {
    glob: Pattern,
    with_scheme: bool,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl OriginPattern {
    pub(crate) fn parse(raw: &str) -> Result<Self, RtcError> {
        let translated =
            translate(raw).map_err(|reason| RtcError::Config(format!("origin pattern {raw:?}: {reason}")))?;
        let glob = Pattern::new(&translated)
            .map_err(|err| RtcError::Config(format!("origin pattern {raw:?}: {err}")))?;
        Ok(Self {
            glob,
            with_scheme: raw.contains("://"),
        })
    }

    pub(crate) fn parse_all(raw: &[String]) -> Result<Vec<Self>, RtcError> {
        raw.iter().map(|pattern| Self::parse(pattern)).collect()
    }

    fn matches(&self, target: &str) -> bool {
        self.glob.matches_with(target, MATCH_OPTIONS)
    }
}

/// Rewrites backslash escapes and `[^` classes into the `glob` dialect.
fn translate(pattern: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().ok_or("trailing backslash")?;
                match escaped {
                    '*' | '?' | '[' | ']' if !in_class => {
                        out.push('[');
                        out.push(escaped);
                        out.push(']');
                    }
                    other => out.push(other),
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.as_str().starts_with('^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            other => out.push(other),
        }
    }
    if in_class {
        return Err("unterminated character class");
    }
    Ok(out)
}

/// Accepts requests without an `Origin`, same-host origins and origins
/// whose host matches one of `patterns`. A pattern containing `://` is
/// matched against `scheme://host` instead.
pub(crate) fn authorize(request: &Request, patterns: &[OriginPattern]) -> Result<(), String> {
    let Some(origin) = request.headers().get(ORIGIN) else {
        return Ok(());
    };
    let origin = origin
        .to_str()
        .map_err(|_| "Origin header is not valid text".to_string())?;
    let url = Url::parse(origin).map_err(|err| format!("failed to parse Origin header {origin:?}: {err}"))?;
    let origin_host = host_with_port(&url);
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !origin_host.is_empty() && origin_host.eq_ignore_ascii_case(host) {
        return Ok(());
    }
    for pattern in patterns {
        let target = if pattern.with_scheme {
            format!("{}://{}", url.scheme(), origin_host)
        } else {
            origin_host.clone()
        };
        if pattern.matches(&target) {
            return Ok(());
        }
    }
    if origin_host.is_empty() {
        return Err(format!("request Origin {origin:?} is not a valid URL with a host"));
    }
    Err(format!("request Origin {origin:?} is not authorized for Host {host:?}"))
}

fn host_with_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}
