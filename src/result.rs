//! The outcome of an SPF evaluation (SPEC_FULL.md C8), modeled on
//! `kumo-spf`'s own `SpfDisposition`/`SpfResult` and the constructor-method
//! convention used by this monorepo's DKIM result type.

use crate::record::Qualifier;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpfDisposition {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl From<Qualifier> for SpfDisposition {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => Self::Pass,
            Qualifier::Fail => Self::Fail,
            Qualifier::SoftFail => Self::SoftFail,
            Qualifier::Neutral => Self::Neutral,
        }
    }
}

impl fmt::Display for SpfDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        })
    }
}

/// The result of a `check_host()` evaluation: a disposition, the context
/// that produced it (for explanation expansion and logging), the
/// mechanism string that was matched (if any), and the resolved
/// explanation text for `Fail` results whose record had an `exp=`
/// modifier.
#[derive(Debug, Clone, Serialize)]
pub struct SpfResult {
    pub disposition: SpfDisposition,
    pub context: String,
    pub matched_mechanism: Option<String>,
    pub explanation: Option<String>,
}

impl SpfResult {
    fn new(disposition: SpfDisposition, context: impl Into<String>) -> Self {
        Self {
            disposition,
            context: context.into(),
            matched_mechanism: None,
            explanation: None,
        }
    }

    pub fn none(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::None, context)
    }

    pub fn neutral(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::Neutral, context)
    }

    pub fn pass(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::Pass, context)
    }

    pub fn fail(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::Fail, context)
    }

    pub fn softfail(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::SoftFail, context)
    }

    pub fn temperror(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::TempError, context)
    }

    pub fn permerror(context: impl Into<String>) -> Self {
        Self::new(SpfDisposition::PermError, context)
    }

    pub fn with_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.matched_mechanism = Some(mechanism.into());
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}
