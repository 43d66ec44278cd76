use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

text_enum! {
    pub enum ParticipantStatus {
        Registered => "REGISTERED",
        Confirmed => "CONFIRMED",
        Attended => "ATTENDED",
        Cancelled => "CANCELLED",
        Waitlisted => "WAITLISTED",
    }
}

/// A user's registration for one event. One row per (event, user).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventParticipant {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: ParticipantStatus,
    pub total_paid: Decimal,
    pub total_outstanding: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventParticipant {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM event_participants WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn update_status(
        id: Uuid,
        status: ParticipantStatus,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE event_participants SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }
}
