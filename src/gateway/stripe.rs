use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;

use super::{
    GatewayError, GatewayRefund, GatewayRefundRequest, GatewayRefundState, GatewayRefundUpdate,
    PaymentGateway,
};

#[derive(Debug, Clone)]
pub struct StripeOptions {
    pub secret_key: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    options: StripeOptions,
}

#[derive(Debug, Deserialize)]
struct StripeRefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
    code: Option<String>,
}

impl StripeGateway {
    pub fn new(options: StripeOptions) -> Self {
        Self {
            client: Client::new(),
            options,
        }
    }

    fn refunds_url(&self) -> String {
        format!("{}/v1/refunds", self.options.api_base.trim_end_matches('/'))
    }
}

fn refund_form(request: &GatewayRefundRequest) -> Result<Vec<(String, String)>, GatewayError> {
    let mut form = vec![
        ("payment_intent".to_string(), request.payment_reference.clone()),
        ("amount".to_string(), request.amount_minor_units()?.to_string()),
        ("reason".to_string(), request.reason.as_str().to_string()),
    ];
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
    Ok(form)
}

fn error_from_response(status: StatusCode, body: &str) -> GatewayError {
    let message = serde_json::from_str::<StripeErrorEnvelope>(body)
        .ok()
        .map(|envelope| {
            let code = envelope.error.code.unwrap_or_default();
            match envelope.error.message {
                Some(message) if code.is_empty() => message,
                Some(message) => format!("{} ({})", message, code),
                None => code,
            }
        })
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::PAYMENT_REQUIRED => GatewayError::Declined(message),
        s if s.is_client_error() => GatewayError::InvalidRequest(message),
        _ => GatewayError::Transport(message),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "Stripe"
    }

    async fn create_refund(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayRefund, GatewayError> {
        let form = refund_form(request)?;

        let response = self
            .client
            .post(self.refunds_url())
            .basic_auth(&self.options.secret_key, None::<&str>)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "Stripe refund request failed");
            return Err(error_from_response(status, &body));
        }

        let refund = response
            .json::<StripeRefundResponse>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(GatewayRefund {
            refund_id: refund.id,
            status: refund.status,
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Webhook timestamps older or newer than this are refused.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Checks a `Stripe-Signature` header (`t=...,v1=...`) against the raw body.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), GatewayError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| GatewayError::InvalidSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(GatewayError::InvalidSignature("missing v1 signature".to_string()));
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(GatewayError::InvalidSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::InvalidSignature(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(GatewayError::InvalidSignature(
        "no matching signature".to_string(),
    ))
}

/// Subset of a Stripe webhook event needed to reconcile refunds.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: StripeRefundObject,
}

#[derive(Debug, Deserialize)]
pub struct StripeRefundObject {
    pub id: String,
    pub status: Option<String>,
    pub failure_reason: Option<String>,
}

impl StripeEvent {
    /// Refund status change carried by this event, if it is one.
    pub fn refund_update(&self) -> Option<GatewayRefundUpdate> {
        if !matches!(
            self.event_type.as_str(),
            "charge.refund.updated" | "refund.updated" | "refund.failed"
        ) {
            return None;
        }

        let state = GatewayRefundState::parse(self.data.object.status.as_deref()?)?;
        Some(GatewayRefundUpdate {
            refund_id: self.data.object.id.clone(),
            state,
            failure_reason: self.data.object.failure_reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayRefundReason;
    use rust_decimal::Decimal;

    #[test]
    fn test_refund_form_encoding() {
        let request = GatewayRefundRequest {
            payment_reference: "pi_3Nabc".to_string(),
            amount: Decimal::new(3050, 2),
            currency: "gbp".to_string(),
            reason: GatewayRefundReason::Duplicate,
            metadata: vec![("refund_reference", "ORF-CAMP24-0A1B2C3D".to_string())],
            idempotency_key: "refund-1-1".to_string(),
        };

        let form = refund_form(&request).unwrap();
        assert!(form.contains(&("payment_intent".to_string(), "pi_3Nabc".to_string())));
        assert!(form.contains(&("amount".to_string(), "3050".to_string())));
        assert!(form.contains(&("reason".to_string(), "duplicate".to_string())));
        assert!(form.contains(&(
            "metadata[refund_reference]".to_string(),
            "ORF-CAMP24-0A1B2C3D".to_string()
        )));
    }

    #[test]
    fn test_error_mapping() {
        let body = r#"{"error":{"message":"Charge ch_1 has already been refunded.","code":"charge_already_refunded"}}"#;
        assert_eq!(
            error_from_response(StatusCode::BAD_REQUEST, body),
            GatewayError::InvalidRequest(
                "Charge ch_1 has already been refunded. (charge_already_refunded)".to_string()
            )
        );
        assert_eq!(
            error_from_response(StatusCode::PAYMENT_REQUIRED, "{}"),
            GatewayError::Declined("HTTP 402".to_string())
        );
        assert!(matches!(
            error_from_response(StatusCode::BAD_GATEWAY, ""),
            GatewayError::Transport(_)
        ));
    }

    #[test]
    fn test_webhook_refund_update() {
        let payload = r#"{
            "type": "charge.refund.updated",
            "data": {"object": {"id": "re_1", "status": "failed", "failure_reason": "expired_or_canceled_card"}}
        }"#;
        let event: StripeEvent = serde_json::from_str(payload).unwrap();
        let update = event.refund_update().unwrap();

        assert_eq!(update.refund_id, "re_1");
        assert_eq!(update.state, GatewayRefundState::Failed);
        assert_eq!(update.failure_reason.as_deref(), Some("expired_or_canceled_card"));
    }

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_webhook_signature() {
        let payload = br#"{"type":"charge.refund.updated"}"#;
        let header = sign(payload, SECRET, 1_700_000_000);
        assert_eq!(
            verify_webhook_signature(payload, &header, SECRET, 1_700_000_060),
            Ok(())
        );
    }

    #[test]
    fn test_forged_or_tampered_webhook_rejected() {
        let payload = br#"{"type":"charge.refund.updated"}"#;
        let forged = sign(payload, "wrong_secret", 1_700_000_000);
        assert!(matches!(
            verify_webhook_signature(payload, &forged, SECRET, 1_700_000_000),
            Err(GatewayError::InvalidSignature(_))
        ));

        let header = sign(payload, SECRET, 1_700_000_000);
        let tampered = br#"{"type":"refund.failed"}"#;
        assert!(verify_webhook_signature(tampered, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_or_malformed_signature_header_rejected() {
        let payload = b"{}";
        let header = sign(payload, SECRET, 1_700_000_000);
        assert!(verify_webhook_signature(payload, &header, SECRET, 1_700_000_600).is_err());
        assert!(verify_webhook_signature(payload, "v1=abcd", SECRET, 1_700_000_000).is_err());
        assert!(verify_webhook_signature(payload, "t=1700000000", SECRET, 1_700_000_000).is_err());
        assert!(verify_webhook_signature(payload, "", SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_unrelated_webhook_ignored() {
        let payload = r#"{"type": "payment_intent.succeeded", "data": {"object": {"id": "pi_1"}}}"#;
        let event: StripeEvent = serde_json::from_str(payload).unwrap();
        assert!(event.refund_update().is_none());
    }
}
