// Discount code resolution
// Codes are resolved against the catalog subtotal inside the create transaction; the
// core only stores the resulting amount.

use crate::error::{BookingError, Result};
use crate::model::Money;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[async_trait]
pub trait DiscountEngine: Send + Sync + 'static {
    // Returns the discount granted by `code` on a purchase of `amount`.
    async fn validate(&self, code: &str, amount: Money) -> Result<Money>;
}

// Used when no promotion backend is wired in: every code is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscount;

#[async_trait]
impl DiscountEngine for NoDiscount {
    async fn validate(&self, code: &str, _amount: Money) -> Result<Money> {
        Err(BookingError::Validation(format!(
            "unknown discount code '{}'",
            code
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountKind {
    // 0-100
    Percentage(u8),
    Fixed(Money),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub kind: DiscountKind,
    pub min_purchase: Option<Money>,
}

// Static code table, e.g. loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct FixedDiscounts {
    rules: HashMap<String, DiscountRule>,
}

impl FixedDiscounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: &str, rule: DiscountRule) -> Self {
        self.rules.insert(code.trim().to_uppercase(), rule);
        self
    }
}

#[async_trait]
impl DiscountEngine for FixedDiscounts {
    async fn validate(&self, code: &str, amount: Money) -> Result<Money> {
        let rule = self
            .rules
            .get(&code.trim().to_uppercase())
            .ok_or_else(|| BookingError::Validation(format!("unknown discount code '{}'", code)))?;

        if let Some(minimum) = rule.min_purchase {
            if amount < minimum {
                return Err(BookingError::Validation(format!(
                    "discount code '{}' requires a purchase of at least {}",
                    code, minimum
                )));
            }
        }

        let discount = match rule.kind {
            DiscountKind::Percentage(percent) => {
                let percent = i64::from(percent.min(100));
                Money::new(amount.amount().saturating_mul(percent) / 100)
            }
            DiscountKind::Fixed(value) => value,
        };
        Ok(discount.min(amount).max(Money::ZERO))
    }
}
