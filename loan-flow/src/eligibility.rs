//! Underwriting rules.
//!
//! [`decide`] is a pure function of its inputs. Rules run in a fixed order and the
//! first one that matches wins:
//!
//! 1. score below the minimum → reject
//! 2. amount within the pre-approved limit → instant approval
//! 3. amount within `max_limit_multiple` × limit → salary evidence required, then an
//!    affordability check on the *total* monthly obligation (new EMI + existing EMIs)
//! 4. anything larger → reject
//!
//! Every threshold is inclusive except the credit floor.
//!
//! [`affordability`] and [`risk_score`] are pure as well. Rejections carry what the
//! customer could still borrow, and every decision is recorded with a risk score.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{offers::loan_amount_for_emi, state::UnderwritingDecision};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    pub min_credit_score: u32,
    pub max_limit_multiple: f64,
    pub max_emi_ratio: f64,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            min_credit_score: 700,
            max_limit_multiple: 2.0,
            max_emi_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EligibilityInput {
    pub credit_score: u32,
    pub requested_amount: f64,
    pub pre_approved_limit: f64,
    pub salary_verified: bool,
    pub new_emi: f64,
    pub existing_emi: f64,
    pub monthly_salary: Option<f64>,
    /// Rate and tenure of the accepted offer, used to size affordable alternatives.
    pub interest_rate: f64,
    pub tenure_months: u32,
}

impl EligibilityInput {
    pub fn total_obligation(&self) -> f64 {
        self.new_emi + self.existing_emi
    }

    /// Total obligation over salary, when a usable salary is known.
    pub fn emi_ratio(&self) -> Option<f64> {
        self.monthly_salary
            .filter(|salary| *salary > 0.0)
            .map(|salary| self.total_obligation() / salary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    BelowMinimumScore {
        score: u32,
        minimum: u32,
    },
    DebtServiceRatioExceeded {
        ratio: f64,
        limit: f64,
        total_obligation: f64,
        /// Largest principal that would have passed on the same rate and tenure.
        max_affordable: f64,
    },
    AmountExceedsMultiple {
        requested: f64,
        maximum: f64,
        pre_approved: f64,
    },
}

impl RejectReason {
    /// What the customer can do instead.
    pub fn recommendations(&self) -> Vec<String> {
        match self {
            Self::BelowMinimumScore { .. } => vec![
                "Improve your credit score by paying existing EMIs on time".into(),
                "Reduce your credit card utilization".into(),
                "Clear any overdue payments".into(),
            ],
            Self::DebtServiceRatioExceeded {
                ratio,
                total_obligation,
                max_affordable,
                ..
            } => {
                let mut tips = Vec::new();
                if *max_affordable > 0.0 {
                    tips.push(format!("Maximum affordable loan amount: {max_affordable:.0}"));
                }
                tips.push("Consider a longer tenure to reduce the EMI".into());
                tips.push(format!(
                    "Current total EMI obligation: {total_obligation:.0} ({:.1}% of income)",
                    ratio * 100.0
                ));
                tips
            }
            Self::AmountExceedsMultiple {
                maximum,
                pre_approved,
                ..
            } => vec![
                format!("Consider applying for {pre_approved:.0} (pre-approved amount)"),
                format!("Maximum eligible amount: {maximum:.0}"),
            ],
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinimumScore { score, minimum } => {
                write!(f, "credit score {score} is below the minimum of {minimum}")
            }
            Self::DebtServiceRatioExceeded { ratio, limit, .. } => write!(
                f,
                "monthly obligations would be {:.1}% of salary, above the {:.0}% limit",
                ratio * 100.0,
                limit * 100.0
            ),
            Self::AmountExceedsMultiple {
                requested, maximum, ..
            } => write!(
                f,
                "requested amount {requested:.0} exceeds the maximum eligible amount of {maximum:.0}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    InstantApprove,
    Approve,
    /// Provisional: re-run [`decide`] once salary evidence is on file.
    NeedsSalaryDocs,
    Reject(RejectReason),
}

impl Decision {
    pub fn as_underwriting(&self) -> UnderwritingDecision {
        match self {
            Self::InstantApprove => UnderwritingDecision::InstantApprove,
            Self::Approve => UnderwritingDecision::Approve,
            Self::NeedsSalaryDocs => UnderwritingDecision::NeedsSalaryDocs,
            Self::Reject(_) => UnderwritingDecision::Reject,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::InstantApprove => "requested amount is within the pre-approved limit".into(),
            Self::Approve => "monthly obligations are within the affordability limit".into(),
            Self::NeedsSalaryDocs => {
                "amount is above the pre-approved limit; salary evidence is required".into()
            }
            Self::Reject(reason) => reason.to_string(),
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        match self {
            Self::Reject(reason) => reason.recommendations(),
            _ => Vec::new(),
        }
    }
}

/// How much more the customer can take on before breaching the EMI ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affordability {
    pub max_emi: f64,
    pub max_loan_amount: f64,
}

/// Headroom left under `policy.max_emi_ratio` after existing installments, and the
/// principal that headroom would service at `annual_rate` over `tenure_months`.
pub fn affordability(
    policy: &EligibilityPolicy,
    monthly_salary: f64,
    existing_emi: f64,
    annual_rate: f64,
    tenure_months: u32,
) -> Affordability {
    let max_emi = monthly_salary * policy.max_emi_ratio - existing_emi;
    if max_emi <= 0.0 {
        return Affordability {
            max_emi: 0.0,
            max_loan_amount: 0.0,
        };
    }
    Affordability {
        max_emi: (max_emi * 100.0).round() / 100.0,
        max_loan_amount: loan_amount_for_emi(max_emi, annual_rate, tenure_months),
    }
}

/// Risk score from 0 (best) to 100.
///
/// Sums a credit component (below 750), an amount component (above the pre-approved
/// limit) and a component for existing debt against salary, then clamps.
pub fn risk_score(input: &EligibilityInput) -> f64 {
    let credit = (750.0 - input.credit_score as f64).max(0.0) / 10.0;
    let amount = if input.pre_approved_limit > 0.0 {
        (input.requested_amount / input.pre_approved_limit - 1.0) * 20.0
    } else {
        20.0
    };
    let debt = match input.monthly_salary {
        Some(salary) if salary > 0.0 => input.existing_emi / salary * 30.0,
        _ => 0.0,
    };
    (credit + amount + debt).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRating {
    Low,
    LowMedium,
    Medium,
    MediumHigh,
    High,
}

impl RiskRating {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 20.0 => Self::Low,
            s if s < 40.0 => Self::LowMedium,
            s if s < 60.0 => Self::Medium,
            s if s < 80.0 => Self::MediumHigh,
            _ => Self::High,
        }
    }
}

impl fmt::Display for RiskRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::LowMedium => "low-medium",
            Self::Medium => "medium",
            Self::MediumHigh => "medium-high",
            Self::High => "high",
        })
    }
}

pub fn decide(policy: &EligibilityPolicy, input: &EligibilityInput) -> Decision {
    if input.credit_score < policy.min_credit_score {
        return Decision::Reject(RejectReason::BelowMinimumScore {
            score: input.credit_score,
            minimum: policy.min_credit_score,
        });
    }

    if input.requested_amount <= input.pre_approved_limit {
        return Decision::InstantApprove;
    }

    let maximum = policy.max_limit_multiple * input.pre_approved_limit;
    if input.requested_amount <= maximum {
        if !input.salary_verified {
            return Decision::NeedsSalaryDocs;
        }
        let Some(ratio) = input.emi_ratio() else {
            return Decision::NeedsSalaryDocs;
        };
        // compared on amounts rather than the ratio so the boundary stays exact
        let salary = input.monthly_salary.unwrap_or_default();
        if input.total_obligation() <= policy.max_emi_ratio * salary {
            return Decision::Approve;
        }
        let headroom = affordability(
            policy,
            salary,
            input.existing_emi,
            input.interest_rate,
            input.tenure_months,
        );
        return Decision::Reject(RejectReason::DebtServiceRatioExceeded {
            ratio,
            limit: policy.max_emi_ratio,
            total_obligation: input.total_obligation(),
            max_affordable: headroom.max_loan_amount,
        });
    }

    Decision::Reject(RejectReason::AmountExceedsMultiple {
        requested: input.requested_amount,
        maximum,
        pre_approved: input.pre_approved_limit,
    })
}
