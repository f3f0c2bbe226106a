//! Parsing of `v=spf1` TXT records into directives and modifiers
//! (SPEC_FULL.md components C4–C6). This module only parses; matching a
//! mechanism against a session requires DNS and budget bookkeeping and
//! lives in `eval.rs`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Default)]
pub struct Record {
    pub directives: Vec<Directive>,
    pub redirect: Option<DomainSpec>,
    pub explanation: Option<DomainSpec>,
}

impl Record {
    /// Parses the already-concatenated, already-selected `v=spf1 ...` TXT
    /// string. Record selection among multiple TXT strings happens one
    /// level up, in `eval.rs`, since it requires seeing every TXT record
    /// for the name at once.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut tokens = s.split(' ').filter(|t| !t.is_empty());
        let version = tokens
            .next()
            .ok_or_else(|| format!("expected version in {s}"))?;
        if version != "v=spf1" {
            return Err(format!("expected SPF version 1 in {s}"));
        }

        let mut new = Self::default();
        for t in tokens {
            if let Ok(directive) = Directive::parse(t) {
                new.directives.push(directive);
                continue;
            }

            if let Ok(modifier) = Modifier::parse(t) {
                match modifier {
                    Modifier::Redirect(domain) => match new.redirect {
                        Some(_) => return Err("duplicate redirect modifier".to_owned()),
                        None => new.redirect = Some(domain),
                    },
                    Modifier::Explanation(domain) => match new.explanation {
                        Some(_) => return Err("duplicate explanation modifier".to_owned()),
                        None => new.explanation = Some(domain),
                    },
                    Modifier::Unknown { .. } => {} // "Unrecognized modifiers MUST be ignored"
                }
                continue;
            }

            return Err(format!("invalid token '{t}'"));
        }

        Ok(new)
    }
}

#[derive(Debug)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl Directive {
    fn parse(s: &str) -> Result<Self, String> {
        let mut qualifier = Qualifier::default();
        let first = s.chars().next().ok_or_else(|| "empty directive".to_string())?;
        let s = match Qualifier::parse(first) {
            Some(q) => {
                qualifier = q;
                &s[first.len_utf8()..]
            }
            None => s,
        };

        Ok(Self {
            qualifier,
            mechanism: Mechanism::parse(s)?,
        })
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier.as_str())?;
        }
        write!(f, "{}", self.mechanism)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    /// `+`
    #[default]
    Pass,
    /// `-`
    Fail,
    /// `~`
    SoftFail,
    /// `?`
    Neutral,
}

impl Qualifier {
    fn parse(c: char) -> Option<Self> {
        Some(match c {
            '+' => Self::Pass,
            '-' => Self::Fail,
            '~' => Self::SoftFail,
            '?' => Self::Neutral,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "+",
            Self::Fail => "-",
            Self::SoftFail => "~",
            Self::Neutral => "?",
        }
    }
}

/// Separate v4/v6 prefix lengths, as used by the dual-family `a`/`mx`
/// mechanisms (`a:host/24//64`). Defaults to a full-length (host) match
/// in both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidrLength {
    pub v4: u8,
    pub v6: u8,
}

impl DualCidrLength {
    /// Whether the `observed` IP address (from the client's IP) matches the
    /// `specified` address (from/via the SPF record), given the specified
    /// CIDR mask lengths. Cross-family comparisons never match.
    pub fn matches(&self, observed: IpAddr, specified: IpAddr) -> bool {
        match (observed, specified) {
            (IpAddr::V4(observed), IpAddr::V4(specified)) => {
                if self.v4 > 32 {
                    return false;
                }
                let mask = (u32::MAX)
                    .checked_shl(32 - self.v4 as u32)
                    .unwrap_or(0);
                (specified.to_bits() & mask) == (observed.to_bits() & mask)
            }
            (IpAddr::V6(observed), IpAddr::V6(specified)) => {
                if self.v6 > 128 {
                    return false;
                }
                let mask = (u128::MAX)
                    .checked_shl(128 - self.v6 as u32)
                    .unwrap_or(0);
                (specified.to_bits() & mask) == (observed.to_bits() & mask)
            }
            _ => false,
        }
    }
}

impl Default for DualCidrLength {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

impl DualCidrLength {
    fn parse_from_end(s: &str) -> Result<(&str, Self), String> {
        match s.rsplit_once('/') {
            Some((left, right)) => {
                let right_cidr: u8 = right
                    .parse()
                    .map_err(|err| format!("invalid dual-cidr-length in {s}: {err}"))?;

                if let Some(prefix) = left.strip_suffix('/') {
                    if let Some((prefix, v4cidr)) = prefix.rsplit_once('/') {
                        let left_cidr: u8 = v4cidr.parse().map_err(|err| {
                            format!(
                                "invalid dual-cidr-length in {s}: parsing v4 cidr portion: {err}"
                            )
                        })?;
                        return Ok((
                            prefix,
                            Self {
                                v4: left_cidr,
                                v6: right_cidr,
                            },
                        ));
                    }
                }
                Ok((
                    left,
                    Self {
                        v4: right_cidr,
                        ..Self::default()
                    },
                ))
            }
            None => Ok((s, Self::default())),
        }
    }
}

impl fmt::Display for DualCidrLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.v4 == 32 && self.v6 == 128 {
            return Ok(());
        }

        write!(f, "/{}", self.v4)?;
        if self.v6 != 128 {
            write!(f, "/{}", self.v6)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Mechanism {
    All,
    Include {
        domain: DomainSpec,
    },
    A {
        domain: Option<DomainSpec>,
        cidr_len: DualCidrLength,
    },
    Mx {
        domain: Option<DomainSpec>,
        cidr_len: DualCidrLength,
    },
    Ptr {
        domain: Option<DomainSpec>,
    },
    Ip4 {
        ip4_network: Ipv4Addr,
        cidr_len: u8,
    },
    Ip6 {
        ip6_network: Ipv6Addr,
        cidr_len: u8,
    },
    Exists {
        domain: DomainSpec,
    },
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Include { domain } => write!(f, "include:{domain}"),
            Self::A { domain, cidr_len } => {
                write!(f, "a")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                write!(f, "{cidr_len}")
            }
            Self::Mx { domain, cidr_len } => {
                write!(f, "mx")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                write!(f, "{cidr_len}")
            }
            Self::Ptr { domain } => {
                write!(f, "ptr")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                Ok(())
            }
            Self::Ip4 {
                ip4_network,
                cidr_len,
            } => write!(f, "ip4:{ip4_network}/{cidr_len}"),
            Self::Ip6 {
                ip6_network,
                cidr_len,
            } => write!(f, "ip6:{ip6_network}/{cidr_len}"),
            Self::Exists { domain } => write!(f, "exists:{domain}"),
        }
    }
}

fn starts_with_number(input: &str) -> Result<(Option<u32>, &str), String> {
    let i = input
        .find(|c: char| !c.is_numeric())
        .unwrap_or(input.len());
    if i == 0 {
        return Ok((None, input));
    }
    let number = input[..i]
        .parse::<u32>()
        .map_err(|err| format!("error parsing number from {input}: {err}"))?;
    Ok((Some(number), &input[i..]))
}

fn starts_with_ident<'a>(s: &'a str, ident: &str) -> Option<&'a str> {
    let prefix = s.get(0..ident.len())?;
    if prefix.eq_ignore_ascii_case(ident) {
        Some(&s[ident.len()..])
    } else {
        None
    }
}

impl Mechanism {
    fn parse(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        if let Some(spec) = starts_with_ident(s, "include:") {
            return Ok(Self::Include {
                domain: DomainSpec::parse(spec)?,
            });
        }

        if let Some(remain) = starts_with_ident(s, "a") {
            let (remain, cidr_len) = DualCidrLength::parse_from_end(remain)?;

            let domain = if let Some(spec) = remain.strip_prefix(':') {
                Some(DomainSpec::parse(spec)?)
            } else if remain.is_empty() {
                None
            } else {
                return Err(format!("invalid 'a' mechanism: {s}"));
            };

            return Ok(Self::A { domain, cidr_len });
        }
        if let Some(remain) = starts_with_ident(s, "mx") {
            let (remain, cidr_len) = DualCidrLength::parse_from_end(remain)?;

            let domain = if let Some(spec) = remain.strip_prefix(':') {
                Some(DomainSpec::parse(spec)?)
            } else if remain.is_empty() {
                None
            } else {
                return Err(format!("invalid 'mx' mechanism: {s}"));
            };

            return Ok(Self::Mx { domain, cidr_len });
        }
        if let Some(remain) = starts_with_ident(s, "ptr") {
            let domain = if let Some(spec) = remain.strip_prefix(':') {
                Some(DomainSpec::parse(spec)?)
            } else if remain.is_empty() {
                None
            } else {
                return Err(format!("invalid 'ptr' mechanism: {s}"));
            };

            return Ok(Self::Ptr { domain });
        }
        if let Some(remain) = starts_with_ident(s, "ip4:") {
            let (addr, len) = match remain.split_once('/') {
                Some((addr, len)) => (addr, Some(len)),
                None => (remain, None),
            };
            let ip4_network = addr
                .parse()
                .map_err(|err| format!("invalid 'ip4' mechanism: {s}: {err}"))?;
            let cidr_len = match len {
                Some(len) => len
                    .parse()
                    .map_err(|err| format!("invalid 'ip4' mechanism: {s}: {err}"))?,
                None => 32,
            };
            if cidr_len > 32 {
                return Err(format!("invalid 'ip4' mechanism: {s}: prefix out of range"));
            }

            return Ok(Self::Ip4 {
                ip4_network,
                cidr_len,
            });
        }
        if let Some(remain) = starts_with_ident(s, "ip6:") {
            let (addr, len) = match remain.split_once('/') {
                Some((addr, len)) => (addr, Some(len)),
                None => (remain, None),
            };
            let ip6_network = addr
                .parse()
                .map_err(|err| format!("invalid 'ip6' mechanism: {s}: {err}"))?;
            let cidr_len = match len {
                Some(len) => len
                    .parse()
                    .map_err(|err| format!("invalid 'ip6' mechanism: {s}: {err}"))?,
                None => 128,
            };
            if cidr_len > 128 {
                return Err(format!("invalid 'ip6' mechanism: {s}: prefix out of range"));
            }

            return Ok(Self::Ip6 {
                ip6_network,
                cidr_len,
            });
        }
        if let Some(spec) = starts_with_ident(s, "exists:") {
            return Ok(Self::Exists {
                domain: DomainSpec::parse(spec)?,
            });
        }

        Err(format!("invalid mechanism {s}"))
    }
}

#[derive(Debug)]
pub enum Modifier {
    Redirect(DomainSpec),
    Explanation(DomainSpec),
    Unknown {
        #[allow(dead_code)]
        name: String,
        #[allow(dead_code)]
        value: DomainSpec,
    },
}

impl Modifier {
    fn parse(s: &str) -> Result<Self, String> {
        if let Some(spec) = starts_with_ident(s, "redirect=") {
            return Ok(Self::Redirect(DomainSpec::parse(spec)?));
        }
        if let Some(spec) = starts_with_ident(s, "exp=") {
            return Ok(Self::Explanation(DomainSpec::parse(spec)?));
        }

        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| format!("invalid modifier {s}"))?;

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && name.chars().next().unwrap().is_ascii_alphabetic();
        if !valid {
            return Err(format!("modifier name '{name}' is invalid"));
        }

        Ok(Self::Unknown {
            name: name.to_string(),
            value: DomainSpec::parse(value)?,
        })
    }
}

#[derive(Debug)]
pub struct DomainSpec {
    pub elements: Vec<MacroElement>,
}

impl DomainSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut elements = vec![];

        fn add_literal(elements: &mut Vec<MacroElement>, literal: &str) {
            match elements.last_mut() {
                Some(MacroElement::Literal(prior)) => {
                    prior.push_str(literal);
                }
                _ => {
                    elements.push(MacroElement::Literal(literal.to_string()));
                }
            }
        }

        fn is_macro_literal(c: char) -> bool {
            let c = c as u32;
            (0x21..=0x24).contains(&c) || (0x26..=0x7e).contains(&c)
        }

        let mut s = s;
        while !s.is_empty() {
            if s.starts_with("%%") {
                add_literal(&mut elements, "%");
                s = &s[2..];
                continue;
            }
            if s.starts_with("%_") {
                add_literal(&mut elements, " ");
                s = &s[2..];
                continue;
            }
            if s.starts_with("%-") {
                add_literal(&mut elements, "%20");
                s = &s[2..];
                continue;
            }
            if s.starts_with("%{") {
                let (name_offset, name_char) = s
                    .char_indices()
                    .nth(2)
                    .ok_or_else(|| format!("unexpected end of input in {s}"))?;
                let (name, url_escape) = MacroName::parse(name_char)?;
                let after_name = name_offset + name_char.len_utf8();
                let mut transformer_digits = None;
                let mut reverse = false;

                let remain = if let Ok((n, r)) = starts_with_number(&s[after_name..]) {
                    transformer_digits = n;
                    r
                } else {
                    &s[after_name..]
                };

                let delimiters = if let Some(rest) = remain.strip_prefix('r') {
                    reverse = true;
                    rest
                } else {
                    remain
                };

                let (delimiters, remain) = delimiters
                    .split_once('}')
                    .ok_or_else(|| format!("expected '}}' to close macro in {s}"))?;

                if !delimiters
                    .chars()
                    .all(|c| ".-+,/_=".contains(c))
                {
                    return Err(format!("invalid macro delimiter in {s}"));
                }

                elements.push(MacroElement::Macro(MacroTerm {
                    name,
                    transformer_digits,
                    reverse,
                    url_escape,
                    delimiters: delimiters.to_string(),
                }));

                s = remain;
                continue;
            }

            if !is_macro_literal(s.chars().next().unwrap()) {
                return Err(format!("invalid macro char in {s}"));
            }

            add_literal(&mut elements, &s[0..1]);
            s = &s[1..];
        }

        Ok(Self { elements })
    }
}

impl fmt::Display for DomainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            match element {
                MacroElement::Literal(lit) => write!(f, "{lit}")?,
                MacroElement::Macro(term) => write!(f, "{term}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum MacroElement {
    Literal(String),
    Macro(MacroTerm),
}

#[derive(Debug)]
pub struct MacroTerm {
    pub name: MacroName,
    /// digits were present in the transformer section
    pub transformer_digits: Option<u32>,
    /// the output needs to be URL-escaped (uppercase macro letter)
    pub url_escape: bool,
    /// the `r` transformer was present
    pub reverse: bool,
    /// the delimiter characters, if any, otherwise empty (meaning `.`)
    pub delimiters: String,
}

impl fmt::Display for MacroTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = if self.url_escape {
            self.name.as_char().to_ascii_uppercase()
        } else {
            self.name.as_char()
        };
        write!(f, "%{{{letter}")?;
        if let Some(digits) = self.transformer_digits {
            write!(f, "{digits}")?;
        }
        if self.reverse {
            f.write_str("r")?;
        }
        write!(f, "{}}}", self.delimiters)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, Copy, Clone)]
pub enum MacroName {
    /// `s` - <sender>
    Sender,
    /// `l` - local-part of <sender>
    LocalPart,
    /// `o` - domain of <sender>
    SenderDomain,
    /// `d` - <domain>
    Domain,
    /// `i` - <ip>
    Ip,
    /// `p` - the validated domain name of <ip> (do not use)
    ValidatedDomainName,
    /// `v` the string `in-addr` if <ip> is ipv4, or `ip6` if <ip> is ipv6
    ReverseDns,
    /// `h` the HELO/EHLO domain
    HeloDomain,
    /// `c` - only in "exp" text: the SMTP client IP (easily readable format)
    ClientIp,
    /// `r` - only in "exp" text: domain name of host performing the check
    RelayingHostName,
    /// `t` - only in "exp" text: the current timestamp
    CurrentUnixTimeStamp,
}

impl MacroName {
    fn parse(c: char) -> Result<(Self, bool), String> {
        let escape = c.is_ascii_uppercase();
        Ok((
            match c.to_ascii_lowercase() {
                's' => Self::Sender,
                'l' => Self::LocalPart,
                'o' => Self::SenderDomain,
                'd' => Self::Domain,
                'i' => Self::Ip,
                'p' => Self::ValidatedDomainName,
                'v' => Self::ReverseDns,
                'h' => Self::HeloDomain,
                'c' => Self::ClientIp,
                'r' => Self::RelayingHostName,
                't' => Self::CurrentUnixTimeStamp,
                _ => return Err(format!("invalid macro name {c}")),
            },
            escape,
        ))
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Sender => 's',
            Self::LocalPart => 'l',
            Self::SenderDomain => 'o',
            Self::Domain => 'd',
            Self::Ip => 'i',
            Self::ValidatedDomainName => 'p',
            Self::ReverseDns => 'v',
            Self::HeloDomain => 'h',
            Self::ClientIp => 'c',
            Self::RelayingHostName => 'r',
            Self::CurrentUnixTimeStamp => 't',
        }
    }

    /// `exp=` explanation text only, per RFC 7208 §8.1.
    pub fn is_exp_only(&self) -> bool {
        matches!(
            self,
            Self::ClientIp | Self::RelayingHostName | Self::CurrentUnixTimeStamp
        )
    }
}
