//! Scope policy consulted before dispatching network-probing tools.

use reqwest::Url;

pub trait ScopePolicy: Send + Sync {
    fn allows(&self, url: &str) -> bool;
}

/// Permits every target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ScopePolicy for AllowAll {
    fn allows(&self, _url: &str) -> bool {
        true
    }
}

/// Permits targets whose host is listed, or is a subdomain of a listed host.
/// An empty list permits everything.
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    hosts: Vec<String>,
}

impl HostAllowlist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { hosts }
    }
}

impl ScopePolicy for HostAllowlist {
    fn allows(&self, url: &str) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
        else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.hosts
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everything() {
        assert!(HostAllowlist::new(Vec::<String>::new()).allows("https://anything.test/x"));
    }

    #[test]
    fn exact_and_subdomain_matches() {
        let policy = HostAllowlist::new(["Target.Test"]);
        assert!(policy.allows("https://target.test/login"));
        assert!(policy.allows("http://api.TARGET.test:8080/"));
        assert!(!policy.allows("https://nottarget.test/"));
        assert!(!policy.allows("https://target.test.evil.test/"));
    }

    #[test]
    fn unparseable_url_is_refused() {
        assert!(!HostAllowlist::new(["a.test"]).allows("not a url"));
    }

    #[test]
    fn ip_hosts_match_literally() {
        let policy = HostAllowlist::new(["10.0.0.5", "::1"]);
        assert!(policy.allows("http://10.0.0.5/"));
        assert!(policy.allows("http://[::1]:80/"));
        assert!(!policy.allows("http://10.0.0.6/"));
    }

    #[test]
    fn allow_all_allows() {
        assert!(AllowAll.allows("gopher://x"));
    }
}
