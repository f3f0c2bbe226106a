//! An RFC 7208 SPF evaluator: given an inbound SMTP session's client IP,
//! HELO/EHLO name, and MAIL FROM address, resolves the target domain's SPF
//! policy via DNS and evaluates it into one of the seven defined results.

pub mod context;
pub mod dns;
pub mod eval;
pub mod record;
pub mod result;


pub use context::SpfContext;
pub use dns::{DnsError, Resolver};
pub use eval::{evaluate, EvalState, Limits};
pub use result::{SpfDisposition, SpfResult};

use std::net::IpAddr;

/// The inputs to a top-level SPF check: the connecting client's IP, the
/// domain to evaluate (usually the MAIL FROM domain), and the MAIL FROM
/// address itself (used for the `%{s}`/`%{l}`/`%{o}` macros). `helo_domain`
/// and `receiver_host` are optional session details used by the `%{h}`/
/// `%{r}` macros respectively; leave them `None` when the caller doesn't
/// have them to hand.
pub struct CheckHostParams {
    pub client_ip: IpAddr,
    pub domain: String,
    pub sender: String,
    pub helo_domain: Option<String>,
    pub receiver_host: Option<String>,
}

impl CheckHostParams {
    /// Runs `check_host()` with default RFC-mandated limits. Equivalent to
    /// `evaluate` with a fresh `EvalState` and `Limits::default()`.
    pub async fn check(self, resolver: &dyn Resolver) -> SpfResult {
        self.check_with_limits(Limits::default(), resolver).await
    }

    pub async fn check_with_limits(self, limits: Limits, resolver: &dyn Resolver) -> SpfResult {
        let now = unix_timestamp();
        let mut ctx = match SpfContext::new(&self.sender, &self.domain, self.client_ip, now) {
            Ok(ctx) => ctx,
            Err(err) => return SpfResult::permerror(err),
        };
        if let Some(helo_domain) = self.helo_domain {
            ctx = ctx.with_helo_domain(helo_domain);
        }
        if let Some(receiver_host) = self.receiver_host {
            ctx = ctx.with_receiver_host(receiver_host);
        }
        let mut state = EvalState::new();
        evaluate(&ctx, &limits, &mut state, resolver).await
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
