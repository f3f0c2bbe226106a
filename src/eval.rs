//! The recursive, budget-enforcing directive evaluator (C7), plus the
//! evaluation limits (C11). Grounded on the *shape* of
//! `kumo-spf/src/record.rs`'s `Record::evaluate`/`Directive::evaluate`
//! (short-circuit order, redirect fallthrough, exp resolution); the
//! `EvalState`/`Limits` budget machinery itself has no teacher precedent —
//! the teacher's source does not enforce RFC 7208's DNS lookup caps or
//! loop detection at all.

use crate::context::SpfContext;
use crate::dns::{DnsError, Resolver};
use crate::record::{DomainSpec, DualCidrLength, Mechanism, Record};
use crate::result::{SpfDisposition, SpfResult};
use futures::future::BoxFuture;
use hickory_resolver::Name;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, warn};

/// RFC-mandated ceilings on the work a single evaluation may do, all
/// overridable by the caller (SPEC_FULL.md §4.11).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_dns_lookups: u32,
    pub max_void_lookups: u32,
    pub max_recursion: u32,
    pub max_mx_records: usize,
    pub max_ptr_names: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_dns_lookups: 10,
            max_void_lookups: 2,
            max_recursion: 10,
            max_mx_records: 10,
            max_ptr_names: 10,
        }
    }
}

/// Mutable bookkeeping shared by reference across one top-level
/// `evaluate` call and every `include`/`redirect` frame it spawns.
#[derive(Debug, Default)]
pub struct EvalState {
    pub dns_lookups: u32,
    pub void_lookups: u32,
    pub recursion_depth: u32,
    pub visited_domains: HashSet<String>,
}

impl EvalState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn gate_lookup(
    state: &mut EvalState,
    limits: &Limits,
    domain: &str,
    mechanism: &str,
) -> Result<(), SpfResult> {
    if state.dns_lookups >= limits.max_dns_lookups {
        warn!(domain, mechanism, "DNS lookup budget exceeded");
        return Err(SpfResult::permerror(format!(
            "DNS lookup budget ({}) exceeded",
            limits.max_dns_lookups
        )));
    }
    state.dns_lookups += 1;
    debug!(domain, mechanism, lookups = state.dns_lookups, "dns lookup");
    Ok(())
}

fn note_void(state: &mut EvalState, limits: &Limits, domain: &str) -> Result<(), SpfResult> {
    state.void_lookups += 1;
    debug!(domain, void_lookups = state.void_lookups, "void lookup");
    if state.void_lookups > limits.max_void_lookups {
        warn!(domain, "void lookup budget exceeded");
        return Err(SpfResult::permerror(format!(
            "void lookup budget ({}) exceeded",
            limits.max_void_lookups
        )));
    }
    Ok(())
}

/// Resolves the address family matching `client_ip`, per RFC 7208 §5.3/
/// §5.4 ("SPF clients MUST query only the indicated address RRset for
/// the current address family"). `exists` (§5.7) always wants A only,
/// regardless of the connecting client's family, so it calls
/// `resolver.lookup_a` directly instead of going through this helper.
async fn resolve_ip(
    resolver: &dyn Resolver,
    state: &mut EvalState,
    limits: &Limits,
    name: &str,
    client_ip: IpAddr,
) -> Result<Vec<IpAddr>, SpfResult> {
    let lookup = match client_ip {
        IpAddr::V4(_) => resolver.lookup_a(name).await,
        IpAddr::V6(_) => resolver.lookup_aaaa(name).await,
    };
    match lookup {
        Ok(ips) => {
            if ips.is_empty() {
                note_void(state, limits, name)?;
            }
            Ok(ips)
        }
        Err(DnsError::NotFound(_)) => {
            note_void(state, limits, name)?;
            Ok(vec![])
        }
        Err(DnsError::LookupFailed(msg)) => Err(SpfResult::temperror(msg)),
    }
}

async fn resolve_mx(
    resolver: &dyn Resolver,
    state: &mut EvalState,
    limits: &Limits,
    name: &str,
) -> Result<Vec<Name>, SpfResult> {
    match resolver.lookup_mx(name).await {
        Ok(mx) => {
            if mx.is_empty() {
                note_void(state, limits, name)?;
            }
            Ok(mx)
        }
        Err(DnsError::NotFound(_)) => {
            note_void(state, limits, name)?;
            Ok(vec![])
        }
        Err(DnsError::LookupFailed(msg)) => Err(SpfResult::temperror(msg)),
    }
}

async fn resolve_ptr(
    resolver: &dyn Resolver,
    state: &mut EvalState,
    limits: &Limits,
    ip: IpAddr,
) -> Result<Vec<Name>, SpfResult> {
    match resolver.lookup_ptr(ip).await {
        Ok(names) => {
            if names.is_empty() {
                note_void(state, limits, &ip.to_string())?;
            }
            Ok(names)
        }
        Err(DnsError::NotFound(_)) => {
            note_void(state, limits, &ip.to_string())?;
            Ok(vec![])
        }
        Err(DnsError::LookupFailed(msg)) => Err(SpfResult::temperror(msg)),
    }
}

fn is_spf_record(txt: &str) -> bool {
    match txt.get(0..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("v=spf1") => {
            matches!(txt.as_bytes().get(6), None | Some(b' '))
        }
        _ => false,
    }
}

fn domain_matches(host: &str, target: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let target = target.trim_end_matches('.').to_ascii_lowercase();
    host == target || host.ends_with(&format!(".{target}"))
}

async fn fetch_record(
    resolver: &dyn Resolver,
    state: &mut EvalState,
    limits: &Limits,
    domain: &str,
) -> Result<Option<Record>, SpfResult> {
    let txts = match resolver.lookup_txt(domain).await {
        Ok(txts) => txts,
        Err(DnsError::NotFound(_)) => {
            note_void(state, limits, domain)?;
            vec![]
        }
        Err(DnsError::LookupFailed(msg)) => return Err(SpfResult::temperror(msg)),
    };

    let candidates: Vec<&String> = txts.iter().filter(|t| is_spf_record(t)).collect();
    match candidates.len() {
        0 => Ok(None),
        1 => Record::parse(candidates[0])
            .map(Some)
            .map_err(SpfResult::permerror),
        _ => Err(SpfResult::permerror(format!(
            "multiple SPF records found for {domain}"
        ))),
    }
}

async fn resolve_explanation(
    exp: &DomainSpec,
    ctx: &SpfContext,
    resolver: &dyn Resolver,
) -> Option<String> {
    let name = ctx.expand(&exp.elements, false).ok()?;
    let txts = resolver.lookup_txt(&name).await.ok()?;
    if txts.len() != 1 {
        return None;
    }
    let parsed = DomainSpec::parse(&txts[0]).ok()?;
    ctx.expand(&parsed.elements, true).ok()
}

fn target_domain(
    ctx: &SpfContext,
    domain: &Option<DomainSpec>,
) -> Result<String, SpfResult> {
    match domain {
        Some(d) => ctx.expand(&d.elements, false).map_err(SpfResult::permerror),
        None => Ok(ctx.sender_domain.clone()),
    }
}

fn match_mechanism<'a>(
    mechanism: &'a Mechanism,
    ctx: &'a SpfContext,
    limits: &'a Limits,
    state: &'a mut EvalState,
    resolver: &'a dyn Resolver,
) -> BoxFuture<'a, Result<bool, SpfResult>> {
    Box::pin(async move {
        match mechanism {
            Mechanism::All => Ok(true),

            Mechanism::Include { domain } => {
                let target = ctx
                    .expand(&domain.elements, false)
                    .map_err(SpfResult::permerror)?;
                gate_lookup(state, limits, &target, "include")?;
                let sub_ctx = ctx.with_domain(target.clone());
                let result = evaluate(&sub_ctx, limits, state, resolver).await;
                match result.disposition {
                    SpfDisposition::Pass => Ok(true),
                    SpfDisposition::Fail | SpfDisposition::SoftFail | SpfDisposition::Neutral => {
                        Ok(false)
                    }
                    SpfDisposition::TempError => Err(SpfResult::temperror(format!(
                        "include:{target}: {}",
                        result.context
                    ))),
                    SpfDisposition::PermError | SpfDisposition::None => {
                        Err(SpfResult::permerror(format!(
                            "include:{target}: {}",
                            result.context
                        )))
                    }
                }
            }

            Mechanism::A { domain, cidr_len } => {
                let target = target_domain(ctx, domain)?;
                gate_lookup(state, limits, &target, "a")?;
                let ips = resolve_ip(resolver, state, limits, &target, ctx.client_ip).await?;
                Ok(ips.iter().any(|ip| cidr_len.matches(ctx.client_ip, *ip)))
            }

            Mechanism::Mx { domain, cidr_len } => {
                let target = target_domain(ctx, domain)?;
                gate_lookup(state, limits, &target, "mx")?;
                let exchanges = resolve_mx(resolver, state, limits, &target).await?;
                if exchanges.len() > limits.max_mx_records {
                    warn!(domain = %target, count = exchanges.len(), "too many MX records");
                    return Err(SpfResult::permerror(format!(
                        "{target} has more than {} MX records",
                        limits.max_mx_records
                    )));
                }
                for exchange in &exchanges {
                    let ips = resolve_ip(
                        resolver,
                        state,
                        limits,
                        &exchange.to_utf8(),
                        ctx.client_ip,
                    )
                    .await?;
                    if ips.iter().any(|ip| cidr_len.matches(ctx.client_ip, *ip)) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Mechanism::Ptr { domain } => {
                let target = target_domain(ctx, domain)?;
                gate_lookup(state, limits, &target, "ptr")?;
                let names = resolve_ptr(resolver, state, limits, ctx.client_ip).await?;
                for name in names.into_iter().take(limits.max_ptr_names) {
                    let host = name.to_utf8();
                    let ips = resolve_ip(resolver, state, limits, &host, ctx.client_ip).await?;
                    if !ips.contains(&ctx.client_ip) {
                        continue;
                    }
                    if domain_matches(&host, &target) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Mechanism::Ip4 {
                ip4_network,
                cidr_len,
            } => {
                let cidr = DualCidrLength {
                    v4: *cidr_len,
                    v6: 128,
                };
                Ok(cidr.matches(ctx.client_ip, IpAddr::V4(*ip4_network)))
            }

            Mechanism::Ip6 {
                ip6_network,
                cidr_len,
            } => {
                let cidr = DualCidrLength {
                    v4: 32,
                    v6: *cidr_len,
                };
                Ok(cidr.matches(ctx.client_ip, IpAddr::V6(*ip6_network)))
            }

            Mechanism::Exists { domain } => {
                let target = ctx
                    .expand(&domain.elements, false)
                    .map_err(SpfResult::permerror)?;
                gate_lookup(state, limits, &target, "exists")?;
                // RFC 7208 §5.7: 'exists' queries A only, never AAAA,
                // regardless of the connecting client's address family.
                let ips = match resolver.lookup_a(&target).await {
                    Ok(ips) => {
                        if ips.is_empty() {
                            note_void(state, limits, &target)?;
                        }
                        ips
                    }
                    Err(DnsError::NotFound(_)) => {
                        note_void(state, limits, &target)?;
                        vec![]
                    }
                    Err(DnsError::LookupFailed(msg)) => return Err(SpfResult::temperror(msg)),
                };
                Ok(!ips.is_empty())
            }
        }
    })
}

/// Recursively decodes and evaluates the SPF record for `ctx.domain`,
/// enforcing the DNS/void-lookup budget and recursion/loop guards in
/// `limits`/`state` (SPEC_FULL.md §4.7).
pub fn evaluate<'a>(
    ctx: &'a SpfContext,
    limits: &'a Limits,
    state: &'a mut EvalState,
    resolver: &'a dyn Resolver,
) -> BoxFuture<'a, SpfResult> {
    Box::pin(async move {
        if state.recursion_depth >= limits.max_recursion {
            warn!(domain = %ctx.domain, "recursion depth exceeded");
            return SpfResult::permerror(format!(
                "recursion depth ({}) exceeded",
                limits.max_recursion
            ));
        }

        let key = ctx.domain.to_ascii_lowercase();
        if state.visited_domains.contains(&key) {
            warn!(domain = %ctx.domain, "include/redirect loop detected");
            return SpfResult::permerror(format!("loop detected evaluating {}", ctx.domain));
        }
        state.visited_domains.insert(key);
        state.recursion_depth += 1;

        let result = evaluate_record(ctx, limits, state, resolver).await;

        state.recursion_depth -= 1;
        result
    })
}

async fn evaluate_record(
    ctx: &SpfContext,
    limits: &Limits,
    state: &mut EvalState,
    resolver: &dyn Resolver,
) -> SpfResult {
    let record = match fetch_record(resolver, state, limits, &ctx.domain).await {
        Ok(Some(record)) => record,
        Ok(None) => return SpfResult::none(format!("no SPF record found for {}", ctx.domain)),
        Err(result) => return result,
    };

    for directive in &record.directives {
        match match_mechanism(&directive.mechanism, ctx, limits, state, resolver).await {
            Ok(true) => {
                let reason = format!("matched '{directive}' for {}", ctx.domain);
                let disposition = SpfDisposition::from(directive.qualifier);
                let mut result = match disposition {
                    SpfDisposition::Pass => SpfResult::pass(reason),
                    SpfDisposition::Fail => SpfResult::fail(reason),
                    SpfDisposition::SoftFail => SpfResult::softfail(reason),
                    SpfDisposition::Neutral => SpfResult::neutral(reason),
                    _ => unreachable!("qualifiers only map to the four disposition variants"),
                }
                .with_mechanism(directive.to_string());

                if result.disposition == SpfDisposition::Fail {
                    if let Some(exp) = &record.explanation {
                        if let Some(text) = resolve_explanation(exp, ctx, resolver).await {
                            result = result.with_explanation(text);
                        }
                    }
                }

                return result;
            }
            Ok(false) => continue,
            Err(result) => return result,
        }
    }

    if let Some(redirect) = &record.redirect {
        let target = match ctx.expand(&redirect.elements, false) {
            Ok(t) => t,
            Err(err) => return SpfResult::permerror(err),
        };
        if let Err(result) = gate_lookup(state, limits, &target, "redirect") {
            return result;
        }
        let redirect_ctx = ctx.with_domain(target);
        let result = evaluate(&redirect_ctx, limits, state, resolver).await;
        return if result.disposition == SpfDisposition::None {
            SpfResult::permerror(format!(
                "redirect target {} has no SPF record",
                redirect_ctx.domain
            ))
        } else {
            result
        };
    }

    SpfResult::neutral(format!("no directive matched for {}", ctx.domain))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::DnsError;
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockResolver {
        txt: HashMap<String, Vec<String>>,
        ip: HashMap<String, Vec<IpAddr>>,
    }

    impl Resolver for MockResolver {
        fn lookup_a<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
            Box::pin(async move {
                match self.ip.get(name) {
                    Some(ips) => Ok(ips.iter().filter(|ip| ip.is_ipv4()).copied().collect()),
                    None => Err(DnsError::NotFound(name.to_string())),
                }
            })
        }

        fn lookup_aaaa<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
            Box::pin(async move {
                match self.ip.get(name) {
                    Some(ips) => Ok(ips.iter().filter(|ip| ip.is_ipv6()).copied().collect()),
                    None => Err(DnsError::NotFound(name.to_string())),
                }
            })
        }

        fn lookup_mx<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<Name>, DnsError>> {
            Box::pin(async move { Err(DnsError::NotFound(name.to_string())) })
        }

        fn lookup_txt<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
            Box::pin(async move {
                match self.txt.get(name) {
                    Some(txts) => Ok(txts.clone()),
                    None => Err(DnsError::NotFound(name.to_string())),
                }
            })
        }

        fn lookup_ptr<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, Result<Vec<Name>, DnsError>> {
            Box::pin(async move { Err(DnsError::NotFound(ip.to_string())) })
        }
    }

    fn ctx(domain: &str, ip: &str) -> SpfContext {
        SpfContext::new(
            &format!("tester@{domain}"),
            domain,
            ip.parse().unwrap(),
            0,
        )
        .unwrap()
    }

    fn run(resolver: MockResolver, ctx: &SpfContext) -> SpfResult {
        let limits = Limits::default();
        let mut state = EvalState::new();
        tokio_test_block_on(evaluate(ctx, &limits, &mut state, &resolver))
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        static RT: Mutex<()> = Mutex::new(());
        let _guard = RT.lock().unwrap();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn directive_ordering_first_match_wins() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all +ip4:1.2.3.4".to_string()],
        );
        let c = ctx("example.com", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::Fail);

        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 +ip4:1.2.3.4 -all".to_string()],
        );
        let c = ctx("example.com", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::Pass);
    }

    #[test]
    fn budget_overflow_on_chained_includes() {
        let mut resolver = MockResolver::default();
        for i in 0..12 {
            resolver.txt.insert(
                format!("d{i}.example"),
                vec![format!("v=spf1 include:d{}.example", i + 1)],
            );
        }
        resolver
            .txt
            .insert("d12.example".to_string(), vec!["v=spf1 -all".to_string()]);
        let c = ctx("d0.example", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::PermError);
    }

    #[test]
    fn loop_detection() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "a.example".to_string(),
            vec!["v=spf1 include:b.example".to_string()],
        );
        resolver.txt.insert(
            "b.example".to_string(),
            vec!["v=spf1 include:a.example".to_string()],
        );
        let c = ctx("a.example", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::PermError);
    }

    #[test]
    fn no_record_is_none() {
        let resolver = MockResolver::default();
        let c = ctx("example.com", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::None);
    }

    #[test]
    fn duplicate_txt_is_permerror() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all".to_string(), "v=spf1 +all".to_string()],
        );
        let c = ctx("example.com", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::PermError);
    }

    #[test]
    fn redirect_fallback_when_nothing_matches() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "a.test".to_string(),
            vec!["v=spf1 redirect=b.test".to_string()],
        );
        resolver
            .txt
            .insert("b.test".to_string(), vec!["v=spf1 -all".to_string()]);
        let c = ctx("a.test", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::Fail);
    }

    #[test]
    fn redirect_ignored_when_a_directive_matches() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "a.test".to_string(),
            vec!["v=spf1 +all redirect=b.test".to_string()],
        );
        let c = ctx("a.test", "1.2.3.4");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::Pass);
    }

    #[test]
    fn ip4_mechanism_does_not_match_ipv6_client() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:192.0.2.0/24 -all".to_string()],
        );
        let c = ctx("example.com", "2001:db8::1");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::Fail);
    }

    #[test]
    fn include_target_with_no_record_is_permerror() {
        let mut resolver = MockResolver::default();
        resolver.txt.insert(
            "example.org".to_string(),
            vec!["v=spf1 include:auth.example.org -all".to_string()],
        );
        let c = ctx("example.org", "203.0.113.5");
        assert_eq!(run(resolver, &c).disposition, SpfDisposition::PermError);
    }
}
