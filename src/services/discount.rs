//! Cascading discount resolution.
//!
//! A price is reduced by at most one discount. Tiers are tried in priority
//! order (individual member override, best role discount, the item's own
//! discount, the event default) and the first one that takes a strictly
//! positive amount off the price wins.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum DiscountError {
    #[error("Discount value must not be negative (got {0})")]
    NegativeValue(Decimal),

    #[error("Percentage discount must be at most 100 (got {0})")]
    PercentageTooLarge(Decimal),

    #[error("Unknown discount type '{0}'")]
    UnknownType(String),

    #[error("Price must not be negative (got {0})")]
    NegativePrice(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "PERCENTAGE",
            DiscountType::Fixed => "FIXED",
        }
    }
}

impl FromStr for DiscountType {
    type Err = DiscountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PERCENTAGE" => Ok(DiscountType::Percentage),
            "FIXED" => Ok(DiscountType::Fixed),
            _ => Err(DiscountError::UnknownType(s.to_string())),
        }
    }
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the applied discount came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountSource {
    Individual,
    Role,
    Item,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    pub kind: DiscountType,
    pub value: Decimal,
}

impl Discount {
    pub fn new(kind: DiscountType, value: Decimal) -> Result<Self, DiscountError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(DiscountError::NegativeValue(value));
        }
        if kind == DiscountType::Percentage && value > Decimal::ONE_HUNDRED {
            return Err(DiscountError::PercentageTooLarge(value));
        }
        Ok(Self { kind, value })
    }

    pub fn percentage(value: Decimal) -> Result<Self, DiscountError> {
        Self::new(DiscountType::Percentage, value)
    }

    pub fn fixed(value: Decimal) -> Result<Self, DiscountError> {
        Self::new(DiscountType::Fixed, value)
    }

    /// Builds a discount from a nullable (type, value) column pair.
    ///
    /// Either half missing means the row carries no discount.
    pub fn from_columns(
        kind: Option<&str>,
        value: Option<Decimal>,
    ) -> Result<Option<Self>, DiscountError> {
        match (kind, value) {
            (Some(kind), Some(value)) if !kind.trim().is_empty() => {
                Self::new(kind.parse()?, value).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Money taken off `price`, rounded to pence and clamped to `[0, price]`.
    pub fn amount_off(&self, price: Decimal) -> Decimal {
        let raw = match self.kind {
            DiscountType::Percentage => price * self.value / Decimal::ONE_HUNDRED,
            DiscountType::Fixed => self.value,
        };
        round_money(raw).max(Decimal::ZERO).min(price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDiscount {
    pub role_id: Uuid,
    pub role_name: String,
    pub discount: Discount,
}

/// Every discount that could apply to one member buying one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscountTiers {
    pub individual: Option<Discount>,
    pub roles: Vec<RoleDiscount>,
    pub item: Option<Discount>,
    pub event: Option<Discount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedDiscount {
    pub original_price: Decimal,
    pub discounted_price: Decimal,
    pub discount_amount: Decimal,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub source: Option<DiscountSource>,
    pub role_id: Option<Uuid>,
}

impl AppliedDiscount {
    fn none(price: Decimal) -> Self {
        Self {
            original_price: price,
            discounted_price: price,
            discount_amount: Decimal::ZERO,
            discount_type: None,
            discount_value: None,
            source: None,
            role_id: None,
        }
    }

    pub fn is_discounted(&self) -> bool {
        self.source.is_some()
    }
}

struct Candidate {
    source: DiscountSource,
    discount: Discount,
    amount: Decimal,
    role_id: Option<Uuid>,
}

type TierFn = fn(&DiscountTiers, Decimal) -> Option<Candidate>;

const TIERS: [TierFn; 4] = [individual_tier, role_tier, item_tier, event_tier];

fn single(source: DiscountSource, discount: Option<Discount>, price: Decimal) -> Option<Candidate> {
    discount.map(|discount| Candidate {
        source,
        discount,
        amount: discount.amount_off(price),
        role_id: None,
    })
}

fn individual_tier(tiers: &DiscountTiers, price: Decimal) -> Option<Candidate> {
    single(DiscountSource::Individual, tiers.individual, price)
}

fn role_tier(tiers: &DiscountTiers, price: Decimal) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for role in &tiers.roles {
        let amount = role.discount.amount_off(price);
        // first role wins ties
        if best.as_ref().map_or(true, |b| amount > b.amount) {
            best = Some(Candidate {
                source: DiscountSource::Role,
                discount: role.discount,
                amount,
                role_id: Some(role.role_id),
            });
        }
    }
    best
}

fn item_tier(tiers: &DiscountTiers, price: Decimal) -> Option<Candidate> {
    single(DiscountSource::Item, tiers.item, price)
}

fn event_tier(tiers: &DiscountTiers, price: Decimal) -> Option<Candidate> {
    single(DiscountSource::Event, tiers.event, price)
}

/// Resolves the single best discount for `price`.
pub fn resolve(price: Decimal, tiers: &DiscountTiers) -> Result<AppliedDiscount, DiscountError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(DiscountError::NegativePrice(price));
    }
    let price = round_money(price);

    let winner = TIERS
        .iter()
        .filter_map(|tier| tier(tiers, price))
        .find(|candidate| candidate.amount > Decimal::ZERO);

    let Some(candidate) = winner else {
        return Ok(AppliedDiscount::none(price));
    };

    tracing::debug!(
        source = ?candidate.source,
        amount = %candidate.amount,
        price = %price,
        "Discount resolved"
    );

    Ok(AppliedDiscount {
        original_price: price,
        discounted_price: (price - candidate.amount).max(Decimal::ZERO),
        discount_amount: candidate.amount,
        discount_type: Some(candidate.discount.kind),
        discount_value: Some(candidate.discount.value),
        source: Some(candidate.source),
        role_id: candidate.role_id,
    })
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
