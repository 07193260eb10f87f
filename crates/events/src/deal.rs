//! Deal events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use dealq_core::{DomainError, DomainResult};

use crate::event::DomainEvent;

/// A deal was created upstream.
///
/// `currency` is carried as-is: normalisation is the publisher's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealCreated {
    pub id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub created_at: DateTime<Utc>,
}

/// Wire shape of [`DealCreated`] before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealCreatedPayload {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub created_at: String,
}

impl DomainEvent for DealCreated {
    const EVENT_TYPE: &'static str = "DealCreated";

    type Payload = DealCreatedPayload;

    fn from_payload(payload: DealCreatedPayload) -> DomainResult<Self> {
        if payload.id.trim().is_empty() {
            return Err(DomainError::validation("deal id must not be empty"));
        }
        if payload.customer_id.trim().is_empty() {
            return Err(DomainError::validation("customerId must not be empty"));
        }
        if payload.currency.trim().is_empty() {
            return Err(DomainError::validation("currency must not be empty"));
        }

        let created_at = DateTime::parse_from_rfc3339(&payload.created_at)
            .map_err(|e| {
                DomainError::validation(format!(
                    "createdAt {:?} is not RFC 3339: {}",
                    payload.created_at, e
                ))
            })?
            .with_timezone(&Utc);

        Ok(Self {
            id: payload.id,
            amount: payload.amount,
            currency: payload.currency,
            customer_id: payload.customer_id,
            created_at,
        })
    }
}
