//! Price quotes for registration packages and merchandise.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::event::Event;
use crate::models::package::EventPaymentPackage;
use crate::models::product::{EventProduct, ProductSize};
use crate::models::service_team::{EventRoleDiscount, EventServiceTeamMember, ItemKind};
use crate::services::discount::{self, AppliedDiscount, DiscountTiers};
use crate::utils::error::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct PriceQuote {
    pub event_id: Uuid,
    pub item_id: Uuid,
    pub item_name: String,
    pub currency: String,
    pub size_id: Option<Uuid>,
    #[serde(flatten)]
    pub pricing: AppliedDiscount,
}

/// Member-level discounts for a user, empty when they are not on the service team.
async fn member_tiers(
    event_id: Uuid,
    user_id: Option<Uuid>,
    kind: ItemKind,
    pool: &PgPool,
) -> Result<DiscountTiers, AppError> {
    let Some(user_id) = user_id else {
        return Ok(DiscountTiers::default());
    };
    let Some(member) = EventServiceTeamMember::find_for_user(event_id, user_id, pool).await? else {
        return Ok(DiscountTiers::default());
    };

    let roles = EventRoleDiscount::find_for_member(event_id, member.id, pool).await?;
    build_member_tiers(&member, &roles, kind)
}

pub fn build_member_tiers(
    member: &EventServiceTeamMember,
    roles: &[EventRoleDiscount],
    kind: ItemKind,
) -> Result<DiscountTiers, AppError> {
    let mut role_discounts = Vec::with_capacity(roles.len());
    for role in roles {
        if let Some(discount) = role.role_discount_for(kind)? {
            role_discounts.push(discount);
        }
    }

    Ok(DiscountTiers {
        individual: member.discount_for(kind)?,
        roles: role_discounts,
        ..DiscountTiers::default()
    })
}

async fn load_event(event_id: Uuid, pool: &PgPool) -> Result<Event, AppError> {
    Event::find_by_id(event_id, pool)
        .await?
        .ok_or_else(|| AppError::not_found("Event", event_id))
}

pub async fn quote_package(
    event_id: Uuid,
    package_id: Uuid,
    user_id: Option<Uuid>,
    pool: &PgPool,
) -> Result<PriceQuote, AppError> {
    let event = load_event(event_id, pool).await?;
    let package = EventPaymentPackage::find_for_event(event_id, package_id, pool)
        .await?
        .ok_or_else(|| AppError::not_found("Package", package_id))?;

    let sold = EventPaymentPackage::count_sold(package.id, pool).await?;
    if !package.is_available_at(Utc::now(), sold) {
        return Err(AppError::ValidationError(format!(
            "Package '{}' is not available",
            package.name
        )));
    }

    let mut tiers = member_tiers(event_id, user_id, ItemKind::Registration, pool).await?;
    tiers.item = package.discount()?;
    tiers.event = event.registration_discount()?;

    let pricing = discount::resolve(package.price, &tiers)?;
    tracing::debug!(
        package = %package.id,
        price = %pricing.discounted_price,
        source = ?pricing.source,
        "Package quoted"
    );

    Ok(PriceQuote {
        event_id,
        item_id: package.id,
        item_name: package.name,
        currency: package.currency,
        size_id: None,
        pricing,
    })
}

/// Base price of a product, including the size modifier when one is chosen.
pub fn product_base_price(product: &EventProduct, size: Option<&ProductSize>) -> Decimal {
    product.price + size.map(|s| s.price_modifier).unwrap_or_default()
}

pub async fn quote_product(
    event_id: Uuid,
    product_id: Uuid,
    user_id: Option<Uuid>,
    size_id: Option<Uuid>,
    pool: &PgPool,
) -> Result<PriceQuote, AppError> {
    let event = load_event(event_id, pool).await?;
    let product = EventProduct::find_for_event(event_id, product_id, pool)
        .await?
        .ok_or_else(|| AppError::not_found("Product", product_id))?;

    let size = match size_id {
        Some(size_id) => Some(
            ProductSize::find_for_product(product.id, size_id, pool)
                .await?
                .ok_or_else(|| AppError::not_found("Product size", size_id))?,
        ),
        None => None,
    };

    let mut tiers = member_tiers(event_id, user_id, ItemKind::Product, pool).await?;
    tiers.item = product.item_discount()?;
    tiers.event = event.product_discount()?;

    let base = product_base_price(&product, size.as_ref());
    let pricing = discount::resolve(base, &tiers)?;
    tracing::debug!(
        product = %product.id,
        price = %pricing.discounted_price,
        source = ?pricing.source,
        "Product quoted"
    );

    Ok(PriceQuote {
        event_id,
        item_id: product.id,
        item_name: product.title,
        currency: "GBP".to_string(),
        size_id,
        pricing,
    })
}
