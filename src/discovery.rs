use std::cell::OnceCell;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::addr::{ServerSpec, parse_server_list};
use crate::sortlist::Sortlist;

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Platform resolver-configuration discovery. The file-based [`ResolvConf`]
/// implementation covers Unix-like systems; embedders can supply their own
/// implementation for registry-, property-, or API-backed platforms.
///
/// Discovery only fills fields that caller options and the environment left
/// unset.
pub trait ConfigDiscovery {
    fn servers(&self) -> Vec<ServerSpec> {
        Vec::new()
    }

    fn search_domains(&self) -> Vec<String> {
        Vec::new()
    }

    /// Raw `options`-style tokens (`ndots:N`, `retrans:MS`, `retry:N`,
    /// `rotate`).
    fn options(&self) -> Option<String> {
        None
    }

    fn sortlist(&self) -> Option<Sortlist> {
        None
    }

    /// Lookup order string: `f` for files, `b` for DNS.
    fn lookups(&self) -> Option<String> {
        None
    }
}

/// Discovery source that finds nothing; configuration comes from options,
/// environment, and defaults only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

impl ConfigDiscovery for NoDiscovery {}

/// Pre-parsed configuration, usable directly as a discovery source. Also the
/// parse result of a `resolv.conf` file.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredConfig {
    pub servers: Vec<ServerSpec>,
    pub search_domains: Vec<String>,
    pub options: Option<String>,
    pub sortlist: Option<Sortlist>,
    pub lookups: Option<String>,
}

impl ConfigDiscovery for DiscoveredConfig {
    fn servers(&self) -> Vec<ServerSpec> {
        self.servers.clone()
    }

    fn search_domains(&self) -> Vec<String> {
        self.search_domains.clone()
    }

    fn options(&self) -> Option<String> {
        self.options.clone()
    }

    fn sortlist(&self) -> Option<Sortlist> {
        self.sortlist.clone()
    }

    fn lookups(&self) -> Option<String> {
        self.lookups.clone()
    }
}

/// File-based discovery reading BIND-style `resolv.conf` syntax. The file is
/// read and parsed once, on first use.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
    parsed: OnceCell<DiscoveredConfig>,
}

impl ResolvConf {
    pub fn new() -> ResolvConf {
        ResolvConf::with_path(RESOLV_CONF_PATH)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> ResolvConf {
        ResolvConf { path: path.into(), parsed: OnceCell::new() }
    }

    fn load(&self) -> &DiscoveredConfig {
        self.parsed.get_or_init(|| match read_file(&self.path) {
            Ok(text) => parse_resolv_conf(&text),
            Err(err) => {
                debug!("could not read {}: {}", self.path.display(), err);
                DiscoveredConfig::default()
            }
        })
    }
}

impl Default for ResolvConf {
    fn default() -> Self {
        ResolvConf::new()
    }
}

impl ConfigDiscovery for ResolvConf {
    fn servers(&self) -> Vec<ServerSpec> {
        self.load().servers.clone()
    }

    fn search_domains(&self) -> Vec<String> {
        self.load().search_domains.clone()
    }

    fn options(&self) -> Option<String> {
        self.load().options.clone()
    }

    fn sortlist(&self) -> Option<Sortlist> {
        self.load().sortlist.clone()
    }

    fn lookups(&self) -> Option<String> {
        self.load().lookups.clone()
    }
}

fn read_file(path: &Path) -> std::io::Result<String> {
    let mut text = String::new();
    std::fs::File::open(path)?.read_to_string(&mut text)?;
    Ok(text)
}

/// Parse `resolv.conf` text. `nameserver` entries accumulate; the last
/// `domain`/`search` line wins; `options` lines are concatenated so that the
/// first occurrence of each token applies.
pub fn parse_resolv_conf(text: &str) -> DiscoveredConfig {
    let mut config = DiscoveredConfig::default();
    for raw_line in text.lines() {
        let line = raw_line
            .split(['#', ';'])
            .next()
            .unwrap_or("")
            .trim();
        if line.is_empty() {
            continue;
        }
        let Some((keyword, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let rest = rest.trim();
        match keyword {
            "nameserver" => config.servers.extend(parse_server_list(rest)),
            "domain" | "search" => {
                config.search_domains = rest
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
            }
            "sortlist" => config.sortlist = Some(Sortlist::parse(rest)),
            "options" => match &mut config.options {
                Some(existing) => {
                    existing.push(' ');
                    existing.push_str(rest);
                }
                None => config.options = Some(rest.to_string()),
            },
            "lookup" | "lookups" => config.lookups = Some(parse_lookups(rest)),
            _ => {}
        }
    }
    config
}

fn parse_lookups(rest: &str) -> String {
    let mut order = String::new();
    for token in rest.split_whitespace() {
        let c = match token {
            "file" | "files" => 'f',
            "bind" | "dns" => 'b',
            _ => continue,
        };
        if !order.contains(c) {
            order.push(c);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# a comment
nameserver 10.0.0.1
nameserver 10.0.0.2 ; trailing comment
domain wrong.example
search corp.example branch.example
sortlist 130.155.160.0/255.255.240.0 130.155.0.0
options ndots:2
options retry:4
lookup file bind
";

    #[test]
    fn test_parse_sample_resolv_conf() {
        let config = parse_resolv_conf(SAMPLE);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].addr, "10.0.0.2".parse::<std::net::IpAddr>().unwrap());
        // The later search line replaces the domain line.
        assert_eq!(config.search_domains, vec!["corp.example", "branch.example"]);
        assert_eq!(config.sortlist.as_ref().unwrap().len(), 2);
        assert_eq!(config.options.as_deref(), Some("ndots:2 retry:4"));
        assert_eq!(config.lookups.as_deref(), Some("fb"));
    }

    #[test]
    fn test_blacklisted_nameserver_is_dropped() {
        let config = parse_resolv_conf("nameserver fec0::1\nnameserver 1.1.1.1\n");
        assert_eq!(config.servers.len(), 1);
    }

    #[test]
    fn test_missing_file_yields_empty_config() {
        let source = ResolvConf::with_path("/definitely/not/here/resolv.conf");
        assert!(source.servers().is_empty());
        assert!(source.options().is_none());
    }

    #[test]
    fn test_file_backed_discovery() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let source = ResolvConf::with_path(file.path());
        assert_eq!(source.servers().len(), 2);
        assert_eq!(source.lookups().as_deref(), Some("fb"));
    }
}
