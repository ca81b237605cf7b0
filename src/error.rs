use thiserror::Error;

pub type Result<T> = std::result::Result<T, DnsError>;

/// Final status delivered to a query callback, and the error currency used
/// throughout the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("DNS server returned answer with no data")]
    NoData,
    #[error("DNS server claims query was misformatted")]
    FormErr,
    #[error("DNS server returned general failure")]
    ServFail,
    #[error("domain name not found")]
    NotFound,
    #[error("DNS server does not implement requested operation")]
    NotImp,
    #[error("DNS server refused query")]
    Refused,
    #[error("timeout while contacting DNS servers")]
    Timeout,
    #[error("misformatted DNS query")]
    BadQuery,
    #[error("misformatted domain name")]
    BadName,
    #[error("unsupported address family")]
    BadFamily,
    #[error("misformatted DNS reply")]
    BadResp,
    #[error("could not contact DNS servers")]
    ConnRefused,
    #[error("out of memory")]
    NoMem,
    #[error("DNS query cancelled")]
    Cancelled,
    #[error("DNS channel is being destroyed")]
    Destruction,
    #[error("channel is not initialized")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    BadConfig(String),
}

impl DnsError {
    /// Map a response-header rcode to the error reported for it, for the
    /// rcodes that are surfaced as errors at this layer.
    pub fn from_rcode(rcode: u8) -> Option<DnsError> {
        match rcode {
            1 => Some(DnsError::FormErr),
            2 => Some(DnsError::ServFail),
            3 => Some(DnsError::NotFound),
            4 => Some(DnsError::NotImp),
            5 => Some(DnsError::Refused),
            _ => None,
        }
    }
}
