//! The per-check session data (`SpfContext`, C3): the sender/domain/client
//! triple plus macro expansion, grounded on `kumo-spf/src/context.rs`, with
//! the `helo_domain`/`receiver_host` fields recovered from
//! `kumo-spf/src/spec.rs`'s independent draft.

use crate::record::{MacroElement, MacroName};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct SpfContext {
    pub sender: String,
    pub local_part: String,
    pub sender_domain: String,
    pub domain: String,
    pub client_ip: IpAddr,
    pub helo_domain: Option<String>,
    pub receiver_host: Option<String>,
    pub now: i64,
}

impl SpfContext {
    /// `sender` is the MAIL FROM address (or, if empty, a synthesized
    /// `postmaster@<helo domain>` per RFC 7208 §2.4). `domain` is the
    /// domain the check is being performed against, initially the sender's
    /// domain but replaced wholesale by `include`/`redirect`.
    pub fn new(sender: &str, domain: &str, client_ip: IpAddr, now: i64) -> Result<Self, String> {
        // RFC 7208 §2.4: when MAIL FROM is empty, use "postmaster" at the
        // HELO/EHLO domain; absent a separate HELO domain here, the target
        // domain being checked stands in for it.
        let sender = if sender.is_empty() {
            format!("postmaster@{domain}")
        } else {
            sender.to_string()
        };

        let (local_part, sender_domain) = match sender.split_once('@') {
            Some((l, d)) => (l.to_string(), d.to_string()),
            None => ("postmaster".to_string(), sender.clone()),
        };
        if sender_domain.is_empty() {
            return Err("sender has no domain".to_string());
        }

        Ok(Self {
            sender,
            local_part,
            sender_domain,
            domain: domain.to_string(),
            client_ip,
            helo_domain: None,
            receiver_host: None,
            now,
        })
    }

    pub fn with_helo_domain(mut self, helo: impl Into<String>) -> Self {
        self.helo_domain = Some(helo.into());
        self
    }

    pub fn with_receiver_host(mut self, host: impl Into<String>) -> Self {
        self.receiver_host = Some(host.into());
        self
    }

    /// Returns a copy of this context with `domain` replaced, as happens
    /// when evaluating `include`/`redirect`/`a`/`mx`/`exists` target
    /// domains and when recursing into another record.
    pub fn with_domain(&self, domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..self.clone()
        }
    }

    /// Expands a domain-spec's macro elements into its final string, per
    /// RFC 7208 §7. `exp_allowed` gates the `c`/`r`/`t` macros, which are
    /// valid only while expanding `exp=` explanation text.
    pub fn expand(&self, elements: &[MacroElement], exp_allowed: bool) -> Result<String, String> {
        let mut result = String::new();
        for element in elements {
            match element {
                MacroElement::Literal(lit) => result.push_str(lit),
                MacroElement::Macro(term) => {
                    if term.name.is_exp_only() && !exp_allowed {
                        return Err(format!(
                            "macro '%{{{}}}' is only valid in exp= text",
                            term.name.as_char()
                        ));
                    }
                    if term.name == MacroName::ValidatedDomainName {
                        return Err("the 'p' macro is not supported".to_string());
                    }

                    let expanded = self.expand_term(term)?;
                    result.push_str(&expanded);
                }
            }
        }
        Ok(result)
    }

    fn expand_term(&self, term: &crate::record::MacroTerm) -> Result<String, String> {
        let value = match term.name {
            MacroName::Sender => self.sender.clone(),
            MacroName::LocalPart => self.local_part.clone(),
            MacroName::SenderDomain => self.sender_domain.clone(),
            MacroName::Domain => self.domain.clone(),
            MacroName::Ip => crate::dns::IpDisplay {
                ip: self.client_ip,
                reverse: false,
            }
            .to_string(),
            MacroName::ValidatedDomainName => unreachable!("rejected above"),
            MacroName::ReverseDns => match self.client_ip {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            MacroName::HeloDomain => self.helo_domain.clone().unwrap_or_default(),
            MacroName::ClientIp => self.client_ip.to_string(),
            MacroName::RelayingHostName => self
                .receiver_host
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            MacroName::CurrentUnixTimeStamp => self.now.to_string(),
        };

        let value = split_on_delimiters(&value, &term.delimiters);
        let mut parts: Vec<&str> = value;
        if term.reverse {
            parts.reverse();
        }
        if let Some(n) = term.transformer_digits {
            let n = n as usize;
            if n < parts.len() {
                parts = parts[parts.len() - n..].to_vec();
            }
        }
        let joined = parts.join(".");

        Ok(if term.url_escape {
            url_escape(&joined)
        } else {
            joined
        })
    }
}

fn split_on_delimiters<'a>(s: &'a str, delimiters: &str) -> Vec<&'a str> {
    let delims: &[char] = if delimiters.is_empty() {
        &['.']
    } else {
        return s.split(|c| delimiters.contains(c)).collect();
    };
    s.split(delims).collect()
}

fn url_escape(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

impl fmt::Display for SpfContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "domain={} sender={} ip={}",
            self.domain, self.sender, self.client_ip
        )
    }
}
