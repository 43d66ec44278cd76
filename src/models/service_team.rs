use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::services::discount::{Discount, DiscountError, RoleDiscount};

/// Which set of discount columns applies to a priced item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Registration,
    Product,
}

/// A user organizing or volunteering on an event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventServiceTeamMember {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub head_of_role: bool,
    pub registration_discount_type: Option<String>,
    pub registration_discount_value: Option<Decimal>,
    pub product_discount_type: Option<String>,
    pub product_discount_value: Option<Decimal>,
    pub assigned_at: DateTime<Utc>,
}

impl EventServiceTeamMember {
    pub async fn find_for_user(
        event_id: Uuid,
        user_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM event_service_team_members WHERE event_id = $1 AND user_id = $2",
        )
        .bind(event_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub fn discount_for(&self, kind: ItemKind) -> Result<Option<Discount>, DiscountError> {
        match kind {
            ItemKind::Registration => Discount::from_columns(
                self.registration_discount_type.as_deref(),
                self.registration_discount_value,
            ),
            ItemKind::Product => Discount::from_columns(
                self.product_discount_type.as_deref(),
                self.product_discount_value,
            ),
        }
    }
}

/// Per-event discount for everyone holding a given role.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRoleDiscount {
    pub id: Uuid,
    pub event_id: Uuid,
    pub role_id: Uuid,
    pub role_name: String,
    pub registration_discount_type: Option<String>,
    pub registration_discount_value: Option<Decimal>,
    pub product_discount_type: Option<String>,
    pub product_discount_value: Option<Decimal>,
}

impl EventRoleDiscount {
    /// Role discounts for every role the member holds, in role assignment order.
    pub async fn find_for_member(
        event_id: Uuid,
        member_id: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT d.id, d.event_id, d.role_id, r.name AS role_name,
                    d.registration_discount_type, d.registration_discount_value,
                    d.product_discount_type, d.product_discount_value
             FROM event_role_discounts d
             JOIN event_roles r ON r.id = d.role_id
             JOIN service_team_member_roles mr ON mr.role_id = d.role_id
             WHERE d.event_id = $1 AND mr.member_id = $2
             ORDER BY mr.assigned_at, r.name",
        )
        .bind(event_id)
        .bind(member_id)
        .fetch_all(pool)
        .await
    }

    pub fn role_discount_for(&self, kind: ItemKind) -> Result<Option<RoleDiscount>, DiscountError> {
        let discount = match kind {
            ItemKind::Registration => Discount::from_columns(
                self.registration_discount_type.as_deref(),
                self.registration_discount_value,
            )?,
            ItemKind::Product => Discount::from_columns(
                self.product_discount_type.as_deref(),
                self.product_discount_value,
            )?,
        };

        Ok(discount.map(|discount| RoleDiscount {
            role_id: self.role_id,
            role_name: self.role_name.clone(),
            discount,
        }))
    }
}
