//! Plan tiers, product mapping and per-plan feature limit tables.
//!
//! The limit tables are the single source of truth for the Cost Guard: both
//! `reserve` and `usage_report` resolve limits through [`limit_rule`] so the
//! enforcement path and the client-facing report can never diverge.

use serde::{Deserialize, Serialize};

/// Sentinel for features that have no practical cap on a plan.
pub const UNLIMITED: f64 = 999_999.0;

/// Subscription plan tier.
///
/// Legacy documents carry `pro` and `standard` variants; they deserialize to
/// their canonical tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    #[serde(alias = "standard")]
    Basic,
    #[serde(alias = "pro")]
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest-rank plan from a list. Empty input is `Free`.
pub fn max_plan<I: IntoIterator<Item = Plan>>(plans: I) -> Plan {
    plans.into_iter().max().unwrap_or(Plan::Free)
}

/// Map a store product identifier to a plan.
///
/// Exact ids are looked up in a static table; unknown ids fall back to a
/// substring heuristic so a renamed SKU that still follows the naming
/// convention resolves correctly. Everything else is `Free`.
pub fn plan_from_product_id(product_id: Option<&str>) -> Plan {
    let Some(product_id) = product_id else {
        return Plan::Free;
    };

    const PRODUCT_TO_PLAN: &[(&str, Plan)] = &[
        ("cnx.standard.monthly", Plan::Basic),
        ("cnx.standard.yearly", Plan::Basic),
        ("cnx.premium.monthly", Plan::Premium),
        ("cnx.premium.yearly", Plan::Premium),
        ("price_basic_monthly", Plan::Basic),
        ("price_premium_monthly", Plan::Premium),
    ];

    if let Some((_, plan)) = PRODUCT_TO_PLAN.iter().find(|(id, _)| *id == product_id) {
        return *plan;
    }

    let lowered = product_id.to_lowercase();
    if lowered.contains("premium") || lowered.contains("pro") {
        Plan::Premium
    } else if lowered.contains("standard") || lowered.contains("basic") {
        Plan::Basic
    } else {
        Plan::Free
    }
}

/// Billable feature tracked by the Cost Guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    CloudSttSec,
    CloudSessionsStarted,
    SummaryGenerated,
    QuizGenerated,
    LlmCalls,
    SessionsCreated,
    ServerSession,
}

impl Feature {
    /// Counter field name in usage documents.
    pub fn key(&self) -> &'static str {
        match self {
            Feature::CloudSttSec => "cloud_stt_sec",
            Feature::CloudSessionsStarted => "cloud_sessions_started",
            Feature::SummaryGenerated => "summary_generated",
            Feature::QuizGenerated => "quiz_generated",
            Feature::LlmCalls => "llm_calls",
            Feature::SessionsCreated => "sessions_created",
            Feature::ServerSession => "server_session",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Resolved limit for a (plan, feature) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitRule {
    /// Monthly (or concurrent, for `server_session`) cap.
    pub limit: f64,
    /// Counter the consumption is recorded against. Premium folds summary and
    /// quiz generation into the combined `llm_calls` counter.
    pub counter: Feature,
    /// Soft caps allow consumption past the limit; an external sweep is
    /// expected to reconcile. Only premium `server_session` is soft.
    pub soft: bool,
}

impl LimitRule {
    fn hard(limit: f64, counter: Feature) -> Self {
        Self {
            limit,
            counter,
            soft: false,
        }
    }

    fn soft(limit: f64, counter: Feature) -> Self {
        Self {
            limit,
            counter,
            soft: true,
        }
    }
}

/// Look up the limit rule for a feature on a plan.
///
/// `None` means the feature is not defined for the plan and consumption must
/// fail closed (free-plan `llm_calls` has no combined budget; callers must
/// check the specific feature instead).
pub fn limit_rule(plan: Plan, feature: Feature) -> Option<LimitRule> {
    use Feature::*;

    match plan {
        Plan::Free => match feature {
            CloudSttSec => Some(LimitRule::hard(1800.0, CloudSttSec)), // 30 min
            CloudSessionsStarted => Some(LimitRule::hard(10.0, CloudSessionsStarted)),
            SummaryGenerated => Some(LimitRule::hard(3.0, SummaryGenerated)),
            QuizGenerated => Some(LimitRule::hard(3.0, QuizGenerated)),
            ServerSession => Some(LimitRule::hard(5.0, ServerSession)),
            SessionsCreated => Some(LimitRule::hard(UNLIMITED, SessionsCreated)),
            LlmCalls => None,
        },
        Plan::Basic => match feature {
            CloudSttSec => Some(LimitRule::hard(7200.0, CloudSttSec)), // 120 min
            CloudSessionsStarted => Some(LimitRule::hard(100.0, CloudSessionsStarted)),
            SummaryGenerated => Some(LimitRule::hard(100.0, SummaryGenerated)),
            QuizGenerated => Some(LimitRule::hard(100.0, QuizGenerated)),
            // Combined budget: summary + quiz allowances.
            LlmCalls => Some(LimitRule::hard(200.0, LlmCalls)),
            ServerSession => Some(LimitRule::hard(300.0, ServerSession)),
            SessionsCreated => Some(LimitRule::hard(100.0, SessionsCreated)),
        },
        Plan::Premium => match feature {
            CloudSttSec => Some(LimitRule::hard(7200.0, CloudSttSec)),
            SummaryGenerated | QuizGenerated | LlmCalls => {
                Some(LimitRule::hard(1000.0, LlmCalls))
            }
            CloudSessionsStarted => Some(LimitRule::hard(UNLIMITED, CloudSessionsStarted)),
            SessionsCreated => Some(LimitRule::hard(UNLIMITED, SessionsCreated)),
            ServerSession => Some(LimitRule::soft(300.0, ServerSession)),
        },
    }
}
