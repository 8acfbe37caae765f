//! Base URL handling shared by every node: normalisation, the docker host
//! fallback rewrite and mount-aware path joining.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

/// Hostname that only resolves from inside Docker Desktop.
pub const DOCKER_HOST: &str = "host.docker.internal";
/// Default bridge gateway address reachable from Linux containers.
pub const DOCKER_GATEWAY: &str = "172.17.0.1";
/// Mount path under which the tool server publishes its tools.
pub const TOOLS_PREFIX: &str = "/tools";

/// Trim the base, optionally upgrade `http://` to `https://`, and strip
/// trailing slashes. An empty base stays empty.
pub fn normalize_base(base: &str, force_https: bool) -> String {
    let base = base.trim();
    if base.is_empty() {
        return String::new();
    }
    let upgraded = match base.strip_prefix("http://") {
        Some(rest) if force_https => format!("https://{rest}"),
        _ => base.to_string(),
    };
    upgraded.trim_end_matches('/').to_string()
}

/// Like [`normalize_base`] but substitutes `default` for an empty base.
pub fn normalize_or_default(base: &str, default: &str, force_https: bool) -> String {
    if base.trim().is_empty() {
        normalize_base(default, force_https)
    } else {
        normalize_base(base, force_https)
    }
}

/// Checks that a normalised base parses as an absolute http(s) URL.
pub fn validate_base(base: &str) -> Result<Url, String> {
    let url = Url::parse(base).map_err(|e| format!("invalid base url `{base}`: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}` in `{base}`")),
    }
}

/// A single substring rewrite applied to a URL when the primary host is
/// unreachable. Only ever used for the retry, never for the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HostRewrite {
    pub from: String,
    pub to: String,
}

impl Default for HostRewrite {
    fn default() -> Self {
        Self {
            from: DOCKER_HOST.to_string(),
            to: DOCKER_GATEWAY.to_string(),
        }
    }
}

impl HostRewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Returns the URL with its host swapped, or the input unchanged when the
    /// host does not match. `from` and `to` are `host` or `host:port`; a port
    /// in `from` must match too. Path and query are never touched.
    pub fn apply(&self, url: &str) -> String {
        self.rewrite_authority(url).unwrap_or_else(|| url.to_string())
    }

    fn rewrite_authority(&self, raw: &str) -> Option<String> {
        let (from_host, from_port) = split_authority(self.from.trim())?;
        let (to_host, to_port) = split_authority(self.to.trim())?;

        let parsed = Url::parse(raw).ok()?;
        let host = parsed.host_str()?;
        if !host.eq_ignore_ascii_case(from_host) {
            return None;
        }
        if from_port.is_some() && from_port != parsed.port_or_known_default() {
            return None;
        }

        // splice into the raw string so the rest of the URL stays byte-identical
        let start = raw.find("://")? + 3;
        let end = raw[start..]
            .find(['/', '?', '#'])
            .map_or(raw.len(), |i| start + i);
        let at = start
            + raw[start..end]
                .to_ascii_lowercase()
                .rfind(&host.to_ascii_lowercase())?;
        // whatever follows the host in the authority is its `:port`, if any
        let port_text = &raw[at + host.len()..end];
        let replacement = match to_port {
            Some(port) => format!("{to_host}:{port}"),
            None => format!("{to_host}{port_text}"),
        };
        Some(format!("{}{replacement}{}", &raw[..at], &raw[end..]))
    }

    /// `Some(rewritten)` only when the rewrite actually changes the URL.
    pub fn retry_target(&self, url: &str) -> Option<String> {
        let rewritten = self.apply(url);
        (rewritten != url).then_some(rewritten)
    }
}

/// Splits `host[:port]`. `None` for an empty host.
fn split_authority(raw: &str) -> Option<(&str, Option<u16>)> {
    if raw.is_empty() {
        return None;
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => match port.parse() {
            Ok(port) => Some((host, Some(port))),
            Err(_) => Some((raw, None)),
        },
        _ => Some((raw, None)),
    }
}

/// Joins `base` and `path` under the mount `prefix` without ever producing
/// the prefix twice, whether it is already in the path or at the end of the
/// base.
pub fn join_url(base: &str, path: &str, prefix: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let prefix = prefix.trim().trim_end_matches('/');

    let mut path = path.trim().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    if prefix.is_empty() {
        return format!("{base}{path}");
    }

    let path_has_prefix = path == prefix || path.starts_with(&format!("{prefix}/"));
    let base_has_prefix = base.ends_with(prefix);

    let final_path = match (path_has_prefix, base_has_prefix) {
        (true, true) => path[prefix.len()..].to_string(),
        (true, false) | (false, true) => path,
        (false, false) => format!("{prefix}{path}"),
    };
    format!("{base}{final_path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_strips_slashes() {
        assert_eq!(normalize_base("  http://h:8000/ ", false), "http://h:8000");
        assert_eq!(normalize_base("http://h//", false), "http://h");
        assert_eq!(normalize_base("   ", false), "");
    }

    #[test]
    fn normalize_forces_https_only_when_asked() {
        assert_eq!(normalize_base("http://h", true), "https://h");
        assert_eq!(normalize_base("http://h", false), "http://h");
        assert_eq!(normalize_base("https://h/", true), "https://h");
    }

    #[test]
    fn empty_base_uses_default() {
        assert_eq!(
            normalize_or_default("", "http://host.docker.internal:8000/", false),
            "http://host.docker.internal:8000"
        );
        assert_eq!(normalize_or_default("http://x", "http://y", false), "http://x");
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(validate_base("http://h:8000").is_ok());
        assert!(validate_base("not a url").is_err());
        assert!(validate_base("ftp://h").is_err());
    }

    #[test]
    fn docker_host_is_rewritten() {
        let rule = HostRewrite::default();
        assert_eq!(
            rule.apply("http://host.docker.internal:8000/x"),
            "http://172.17.0.1:8000/x"
        );
        assert_eq!(rule.apply("http://example.com/x"), "http://example.com/x");
    }

    #[test]
    fn rewrite_leaves_path_and_query_alone() {
        let rule = HostRewrite::default();
        assert_eq!(
            rule.apply("http://host.docker.internal:8000/proxy/host.docker.internal?to=host.docker.internal"),
            "http://172.17.0.1:8000/proxy/host.docker.internal?to=host.docker.internal"
        );
        // the token only in the path is no match at all
        let url = "http://example.com/host.docker.internal";
        assert_eq!(rule.apply(url), url);
        assert_eq!(rule.retry_target(url), None);
    }

    #[test]
    fn rewrite_with_ports() {
        let rule = HostRewrite::new("127.0.0.1:1", "127.0.0.1:4010");
        assert_eq!(rule.apply("http://127.0.0.1:1/v1/models"), "http://127.0.0.1:4010/v1/models");
        // another port on the same host is left alone
        assert_eq!(rule.apply("http://127.0.0.1:10/v1"), "http://127.0.0.1:10/v1");

        let host_only = HostRewrite::new("backend", "10.0.0.2");
        assert_eq!(host_only.apply("https://backend:9443/x"), "https://10.0.0.2:9443/x");

        let default_port = HostRewrite::new("backend:80", "gateway:8080");
        assert_eq!(default_port.apply("http://backend:80/x"), "http://gateway:8080/x");
        assert_eq!(default_port.apply("http://user@backend/x"), "http://user@gateway:8080/x");
    }

    #[test]
    fn retry_target_only_when_changed() {
        let rule = HostRewrite::default();
        assert_eq!(rule.retry_target("http://example.com"), None);
        assert_eq!(
            rule.retry_target("http://host.docker.internal"),
            Some("http://172.17.0.1".to_string())
        );
    }

    #[test]
    fn join_adds_prefix_once() {
        assert_eq!(join_url("http://h/", "/sub", "/tools"), "http://h/tools/sub");
        assert_eq!(join_url("http://h", "/tools/sub", "/tools"), "http://h/tools/sub");
        assert_eq!(join_url("http://h", "sub", "/tools"), "http://h/tools/sub");
        assert_eq!(join_url("http://h", "/tools", "/tools"), "http://h/tools");
    }

    #[test]
    fn join_respects_prefix_already_in_base() {
        assert_eq!(join_url("http://h/tools", "/sub", "/tools"), "http://h/tools/sub");
        assert_eq!(join_url("http://h/tools/", "/tools/sub", "/tools"), "http://h/tools/sub");
    }

    #[test]
    fn join_without_prefix_is_plain_concat() {
        assert_eq!(join_url("http://h/", "x", ""), "http://h/x");
    }
}
