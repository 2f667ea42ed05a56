//! Request filtering by method, path and host.

use regex::Regex;
use tracing::debug;

/// Hosts accepted by default: loopback only.
pub const DEFAULT_HOST_ACCEPT: &str = r"^localhost$,^127\.0\.0\.1$,^\[::1\]$";
/// Paths accepted by default: everything.
pub const DEFAULT_PATH_ACCEPT: &str = "^.*";
/// Paths rejected by default: pod exec and attach.
pub const DEFAULT_PATH_REJECT: &str = r"^/api/.*/pods/.*/exec,^/api/.*/pods/.*/attach";
/// Methods rejected by default: none.
pub const DEFAULT_METHOD_REJECT: &str = "^$";

/// Rejects requests which don't match one of the specified regular expressions.
#[derive(Debug, Clone)]
pub struct FilterServer {
    /// Only paths that match this list will be accepted.
    pub accept_paths: Vec<Regex>,
    /// Paths that match this list will be rejected, even if they match the above.
    pub reject_paths: Vec<Regex>,
    /// Hosts are required to match this list.
    pub accept_hosts: Vec<Regex>,
    /// Methods that match this list are rejected.
    pub reject_methods: Vec<Regex>,
}

/// Splits a comma separated list of regexps into compiled form.
pub fn make_regexp_array(s: &str) -> Result<Vec<Regex>, regex::Error> {
    s.split(',').map(Regex::new).collect()
}

impl Default for FilterServer {
    fn default() -> Self {
        // The default patterns are statically known to compile.
        FilterServer {
            accept_paths: make_regexp_array(DEFAULT_PATH_ACCEPT).expect("valid default patterns"),
            reject_paths: make_regexp_array(DEFAULT_PATH_REJECT).expect("valid default patterns"),
            accept_hosts: make_regexp_array(DEFAULT_HOST_ACCEPT).expect("valid default patterns"),
            reject_methods: make_regexp_array(DEFAULT_METHOD_REJECT)
                .expect("valid default patterns"),
        }
    }
}

fn matches_any(s: &str, regexps: &[Regex]) -> bool {
    regexps.iter().any(|re| re.is_match(s))
}

impl FilterServer {
    pub fn accept(&self, method: &str, path: &str, host: &str) -> bool {
        if matches_any(path, &self.reject_paths) {
            debug!(msg = "filter rejecting path", path);
            return false;
        }
        if matches_any(method, &self.reject_methods) {
            debug!(msg = "filter rejecting method", method);
            return false;
        }
        matches_any(path, &self.accept_paths) && matches_any(host, &self.accept_hosts)
    }
}

/// Get the host from a `Host` header value like `localhost` or `localhost:8080`.
pub fn extract_host(header: &str) -> &str {
    if let Some(rest) = header.strip_prefix('[') {
        // Bracketed IPv6: drop the port when one is present.
        if let Some(end) = rest.find(']') {
            if rest[end + 1..].starts_with(':') {
                return &rest[..end];
            }
        }
        header
    } else {
        match header.rfind(':') {
            Some(idx) if !header[..idx].contains(':') => &header[..idx],
            _ => header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_rejects_pod_exec_and_attach_for_any_host() {
        let filter = FilterServer::default();
        assert!(!filter.accept("GET", "/api/v1/namespaces/ns/pods/p/exec", "localhost"));
        assert!(!filter.accept("GET", "/api/v1/namespaces/ns/pods/p/exec", "example.com"));
        assert!(!filter.accept("POST", "/api/v1/namespaces/ns/pods/p/attach", "127.0.0.1"));
    }

    #[test]
    fn default_filter_accepts_loopback_only() {
        let filter = FilterServer::default();
        assert!(filter.accept("GET", "/api/v1/pods", "localhost"));
        assert!(filter.accept("POST", "/api/v1/namespaces/ns/configmaps", "127.0.0.1"));
        assert!(!filter.accept("GET", "/api/v1/pods", "example.com"));
    }

    #[test]
    fn reject_methods_take_precedence_over_accepts() {
        let filter = FilterServer {
            reject_methods: make_regexp_array("^DELETE$").unwrap(),
            ..FilterServer::default()
        };
        assert!(filter.accept("GET", "/api/v1/pods", "localhost"));
        assert!(!filter.accept("DELETE", "/api/v1/pods", "localhost"));
    }

    #[test]
    fn extracts_host_from_header_values() {
        assert_eq!(extract_host("localhost"), "localhost");
        assert_eq!(extract_host("localhost:8888"), "localhost");
        assert_eq!(extract_host("127.0.0.1:8888"), "127.0.0.1");
        assert_eq!(extract_host("[::1]"), "[::1]");
        assert_eq!(extract_host("[::1]:8888"), "::1");
    }
}
