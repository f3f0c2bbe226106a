use futures::future::BoxFuture;
use hickory_resolver::{Name, ResolveError, TokioResolver};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// A DNS failure, classified into the two buckets the evaluation engine
/// cares about: absence of data (counts as a void lookup) and everything
/// else (maps to `TempError`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS record {0} not found")]
    NotFound(String),
    #[error("{0}")]
    LookupFailed(String),
}

impl DnsError {
    pub(crate) fn from_resolve(name: &str, err: ResolveError) -> Self {
        if err.is_no_records_found() || err.is_nx_domain() {
            DnsError::NotFound(name.to_string())
        } else {
            DnsError::LookupFailed(format!("failed to query DNS for {name}: {err}"))
        }
    }
}

/// A trait for entities that perform the handful of DNS lookups an SPF
/// evaluation needs. The core never talks to a resolver directly; every
/// lookup goes through this trait so that tests can substitute a
/// zone-file-backed mock.
///
/// `lookup_a`/`lookup_aaaa` are kept separate, rather than merged into a
/// single "lookup_ip", because several mechanisms (`a`, `mx`, `ptr`) must
/// query only the address family matching the client's IP (RFC 7208
/// §5.3-§5.5); merging the families would let a zone with only the
/// non-matching family's records dodge the void-lookup count.
pub trait Resolver: Sync + Send {
    fn lookup_a<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>>;
    fn lookup_aaaa<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>>;
    fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<Name>, DnsError>>;
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>, DnsError>>;
    fn lookup_ptr<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, Result<Vec<Name>, DnsError>>;
}

impl Resolver for TokioResolver {
    fn lookup_a<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
        Box::pin(async move {
            self.ipv4_lookup(name)
                .await
                .map_err(|err| DnsError::from_resolve(name, err))?
                .into_iter()
                .map(|a| Ok(IpAddr::V4(a.0)))
                .collect()
        })
    }

    fn lookup_aaaa<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
        Box::pin(async move {
            self.ipv6_lookup(name)
                .await
                .map_err(|err| DnsError::from_resolve(name, err))?
                .into_iter()
                .map(|aaaa| Ok(IpAddr::V6(aaaa.0)))
                .collect()
        })
    }

    fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<Name>, DnsError>> {
        Box::pin(async move {
            self.mx_lookup(name)
                .await
                .map_err(|err| DnsError::from_resolve(name, err))?
                .into_iter()
                .map(|mx| Ok(mx.exchange().clone()))
                .collect()
        })
    }

    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        Box::pin(async move {
            self.txt_lookup(name)
                .await
                .map_err(|err| DnsError::from_resolve(name, err))?
                .into_iter()
                .map(|txt| {
                    Ok(txt
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect())
                })
                .collect()
        })
    }

    fn lookup_ptr<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, Result<Vec<Name>, DnsError>> {
        Box::pin(async move {
            let name = ip.to_string();
            self.reverse_lookup(ip)
                .await
                .map_err(|err| DnsError::from_resolve(&name, err))?
                .into_iter()
                .map(|ptr| Ok(ptr.0))
                .collect()
        })
    }
}

/// Renders an IP address in the dotted/nibble form used by the `%{i}`
/// macro and PTR query names: IPv4 is plain dotted-decimal, IPv6 is
/// dot-separated hex nibbles (RFC 7208 §7.3). `reverse` additionally
/// reverses byte (and, for v6, nibble) order, as needed for PTR names.
pub struct IpDisplay {
    pub ip: IpAddr,
    pub reverse: bool,
}

impl fmt::Display for IpDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(v4) => {
                let mut bytes = v4.octets();
                if self.reverse {
                    bytes.reverse();
                }
                let mut first = true;
                for byte in bytes {
                    if !first {
                        f.write_str(".")?;
                    }
                    write!(f, "{byte}")?;
                    first = false;
                }
                Ok(())
            }
            IpAddr::V6(v6) => {
                let mut bytes = v6.octets();
                if self.reverse {
                    bytes.reverse();
                }
                let mut first = true;
                for byte in bytes {
                    if !first {
                        f.write_str(".")?;
                    }
                    let (upper, lower) = (byte >> 4, byte & 0xf);
                    if self.reverse {
                        write!(f, "{lower:x}.{upper:x}")?;
                    } else {
                        write!(f, "{upper:x}.{lower:x}")?;
                    }
                    first = false;
                }
                Ok(())
            }
        }
    }
}
