use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::addr::ServerSpec;
use crate::discovery::ConfigDiscovery;
use crate::error::{DnsError, Result};
use crate::sortlist::Sortlist;
use crate::wire::DEFAULT_EDNS_SIZE;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_TRIES: u32 = 3;
pub const DEFAULT_NDOTS: u32 = 1;
pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_LOOKUPS: &str = "fb";

/// Caller-supplied channel options. Every field is optional; unset fields are
/// filled from the environment, platform discovery, and built-in defaults, in
/// that order.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub servers: Option<Vec<ServerSpec>>,
    pub timeout: Option<Duration>,
    pub tries: Option<u32>,
    pub ndots: Option<u32>,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub edns_payload_size: Option<u16>,
    pub udp_max_queries: Option<u32>,
    pub domains: Option<Vec<String>>,
    pub lookups: Option<String>,
    pub sortlist: Option<Sortlist>,
    pub rotate: Option<bool>,
    pub edns: Option<bool>,

    /// Send every query over TCP from the first try.
    pub use_tcp_only: bool,
    /// Trim the server table to its first entry after configuration.
    pub primary: bool,
    /// Accept truncated UDP responses instead of upgrading to TCP.
    pub ignore_truncation: bool,
    /// Deliver SERVFAIL/NOTIMP/REFUSED responses instead of retrying.
    pub no_check_response: bool,

    /// Fixed seed for query-id generation. Intended for tests; when unset the
    /// generator is seeded from the operating system.
    pub query_id_seed: Option<u64>,
}

/// Immutable-after-init resolver policy for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub servers: Vec<ServerSpec>,
    pub timeout: Duration,
    pub tries: u32,
    pub ndots: u32,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub ednspsz: u16,
    pub udp_max_queries: u32,
    pub domains: Vec<String>,
    pub lookups: String,
    pub sortlist: Sortlist,
    pub rotate: bool,
    pub edns: bool,
    pub use_tcp_only: bool,
    pub ignore_truncation: bool,
    pub no_check_response: bool,
}

impl ChannelConfig {
    /// Resolve options against the process environment and the given platform
    /// discovery source.
    pub fn resolve(options: ChannelOptions, discovery: &dyn ConfigDiscovery) -> Result<ChannelConfig> {
        Self::resolve_with_env(options, discovery, &|var| std::env::var(var).ok())
    }

    /// As [`ChannelConfig::resolve`], with an injectable environment lookup.
    pub fn resolve_with_env(
        mut options: ChannelOptions,
        discovery: &dyn ConfigDiscovery,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<ChannelConfig> {
        apply_environment(&mut options, env);
        apply_discovery(&mut options, discovery);

        let mut servers = options
            .servers
            .unwrap_or_default();
        if servers.is_empty() {
            // If nobody specified servers, try a local named.
            servers.push(ServerSpec::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        }
        if options.primary {
            servers.truncate(1);
        }

        let config = ChannelConfig {
            servers,
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
            tries: options.tries.unwrap_or(DEFAULT_TRIES),
            ndots: options.ndots.unwrap_or(DEFAULT_NDOTS),
            udp_port: options.udp_port.unwrap_or(DEFAULT_PORT),
            tcp_port: options.tcp_port.unwrap_or(DEFAULT_PORT),
            ednspsz: options.edns_payload_size.unwrap_or(DEFAULT_EDNS_SIZE),
            udp_max_queries: options.udp_max_queries.unwrap_or(0),
            domains: options.domains.unwrap_or_default(),
            lookups: options.lookups.unwrap_or_else(|| DEFAULT_LOOKUPS.to_string()),
            sortlist: options.sortlist.unwrap_or_default(),
            rotate: options.rotate.unwrap_or(false),
            edns: options.edns.unwrap_or(true),
            use_tcp_only: options.use_tcp_only,
            ignore_truncation: options.ignore_truncation,
            no_check_response: options.no_check_response,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty()
            || self.tries == 0
            || self.ndots == 0
            || self.timeout.is_zero()
            || self.lookups.is_empty()
        {
            return Err(DnsError::NotInitialized);
        }
        Ok(())
    }

    pub fn nservers(&self) -> usize {
        self.servers.len()
    }

    /// UDP size above which a response counts as oversized for truncation
    /// purposes, given the channel's current EDNS state.
    pub fn packet_size(&self, edns_enabled: bool) -> u16 {
        if edns_enabled {
            self.ednspsz
        } else {
            crate::wire::MAX_UDP_SIZE
        }
    }
}

fn apply_environment(options: &mut ChannelOptions, env: &dyn Fn(&str) -> Option<String>) {
    if options.domains.is_none() {
        if let Some(localdomain) = env("LOCALDOMAIN") {
            let domains: Vec<String> = localdomain
                .split([' ', ','])
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
            if !domains.is_empty() {
                options.domains = Some(domains);
            }
        }
    }
    if let Some(res_options) = env("RES_OPTIONS") {
        apply_options_tokens(options, &res_options);
    }
}

fn apply_discovery(options: &mut ChannelOptions, discovery: &dyn ConfigDiscovery) {
    if options.servers.as_ref().is_none_or(|s| s.is_empty()) {
        let servers = discovery.servers();
        if !servers.is_empty() {
            options.servers = Some(servers);
        }
    }
    if options.domains.is_none() {
        let domains = discovery.search_domains();
        if !domains.is_empty() {
            options.domains = Some(domains);
        }
    }
    if options.sortlist.is_none() {
        options.sortlist = discovery.sortlist();
    }
    if options.lookups.is_none() {
        options.lookups = discovery.lookups();
    }
    if let Some(tokens) = discovery.options() {
        apply_options_tokens(options, &tokens);
    }
}

/// Apply an `options`-style token string (`RES_OPTIONS`, `options` lines from
/// platform configuration). Each token fills its field only if no
/// higher-precedence source has set it.
pub(crate) fn apply_options_tokens(options: &mut ChannelOptions, tokens: &str) {
    for token in tokens.split_whitespace() {
        if let Some(val) = token.strip_prefix("ndots:") {
            if options.ndots.is_none() {
                options.ndots = val.parse().ok();
            }
        } else if let Some(val) = token.strip_prefix("retrans:") {
            if options.timeout.is_none() {
                options.timeout = val.parse().ok().map(Duration::from_millis);
            }
        } else if let Some(val) = token.strip_prefix("retry:") {
            if options.tries.is_none() {
                options.tries = val.parse().ok();
            }
        } else if token == "rotate" && options.rotate.is_none() {
            options.rotate = Some(true);
        }
    }
}
