//! Rate table, installment maths and offer generation for the sales stage.

use serde::{Deserialize, Serialize};

use crate::state::LoanTerms;

/// At most this many offers are presented at once.
pub const MAX_OFFERS: usize = 3;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Standard amortised monthly installment.
pub fn calculate_emi(principal: f64, annual_rate: f64, tenure_months: u32) -> f64 {
    if tenure_months == 0 {
        return round2(principal);
    }
    let n = tenure_months as f64;
    let monthly_rate = annual_rate / 12.0;
    if monthly_rate == 0.0 {
        return round2(principal / n);
    }
    let growth = (1.0 + monthly_rate).powf(n);
    round2(principal * monthly_rate * growth / (growth - 1.0))
}

/// Principal whose installment at `annual_rate` over `tenure_months` is `emi`.
pub fn loan_amount_for_emi(emi: f64, annual_rate: f64, tenure_months: u32) -> f64 {
    if emi <= 0.0 || tenure_months == 0 {
        return 0.0;
    }
    let n = tenure_months as f64;
    let monthly_rate = annual_rate / 12.0;
    if monthly_rate == 0.0 {
        return round2(emi * n);
    }
    let growth = (1.0 + monthly_rate).powf(n);
    round2(emi * (growth - 1.0) / (monthly_rate * growth))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanOffer {
    pub amount: f64,
    pub tenure_months: u32,
    pub interest_rate: f64,
    pub monthly_emi: f64,
    pub processing_fee: f64,
    pub total_interest: f64,
    pub total_payable: f64,
}

impl LoanOffer {
    pub fn new(amount: f64, tenure_months: u32, interest_rate: f64, fee_rate: f64) -> Self {
        let monthly_emi = calculate_emi(amount, interest_rate, tenure_months);
        let total_payable = round2(monthly_emi * tenure_months as f64);
        Self {
            amount,
            tenure_months,
            interest_rate,
            monthly_emi,
            processing_fee: round2(amount * fee_rate),
            total_interest: round2(total_payable - amount),
            total_payable,
        }
    }

    pub fn terms(&self) -> LoanTerms {
        LoanTerms {
            tenure_months: self.tenure_months,
            interest_rate: self.interest_rate,
            monthly_emi: self.monthly_emi,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} months at {:.2}% p.a., EMI {:.2} (processing fee {:.2}, total interest {:.2})",
            self.tenure_months,
            self.interest_rate * 100.0,
            self.monthly_emi,
            self.processing_fee,
            self.total_interest,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBand {
    pub tenure_months: u32,
    pub annual_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateTable {
    pub bands: Vec<RateBand>,
    /// Added to every band when the request exceeds the pre-approved limit.
    pub above_limit_loading: f64,
    pub processing_fee_rate: f64,
    /// No negotiated rate goes below this.
    pub floor_rate: f64,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            bands: vec![
                RateBand {
                    tenure_months: 12,
                    annual_rate: 0.105,
                },
                RateBand {
                    tenure_months: 24,
                    annual_rate: 0.11,
                },
                RateBand {
                    tenure_months: 36,
                    annual_rate: 0.115,
                },
            ],
            above_limit_loading: 0.005,
            processing_fee_rate: 0.02,
            floor_rate: 0.09,
        }
    }
}

impl RateTable {
    /// Builds up to [`MAX_OFFERS`] offers for `amount`, each rate lowered by `discount`.
    pub fn offers(&self, amount: f64, pre_approved_limit: f64, discount: f64) -> Vec<LoanOffer> {
        let loading = if amount > pre_approved_limit {
            self.above_limit_loading
        } else {
            0.0
        };
        self.bands
            .iter()
            .take(MAX_OFFERS)
            .map(|band| {
                let rate = (band.annual_rate + loading - discount).max(self.floor_rate);
                let rate = (rate * 10_000.0).round() / 10_000.0;
                LoanOffer::new(amount, band.tenure_months, rate, self.processing_fee_rate)
            })
            .collect()
    }
}

/// Index of the offer whose tenure is closest to the customer's preference.
pub fn recommended_index(offers: &[LoanOffer], preferred_tenure: Option<u32>) -> usize {
    let Some(preferred) = preferred_tenure else {
        return offers.len().saturating_sub(1) / 2;
    };
    offers
        .iter()
        .enumerate()
        .min_by_key(|(_, offer)| offer.tenure_months.abs_diff(preferred))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationPolicy {
    /// Counter-offers allowed before the final offer is presented.
    pub max_attempts: u32,
    pub rate_step: f64,
    pub max_discount: f64,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_step: 0.0025,
            max_discount: 0.01,
        }
    }
}

impl NegotiationPolicy {
    pub fn discount_for(&self, attempts: u32) -> f64 {
        if attempts >= self.max_attempts {
            return self.max_discount;
        }
        (self.rate_step * attempts as f64).min(self.max_discount)
    }
}
