use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use examguard::engine::{PaymentConfirmation, PaymentEvent, PaymentVerifier};

type HmacSha256 = Hmac<Sha256>;

/// Gateway signature checks. Signatures are lowercase hex HMAC-SHA256:
/// confirmations sign `"{order_id}|{payment_id}"` with the key secret,
/// webhooks sign the raw request body with the webhook secret.
pub struct GatewaySignatureVerifier {
    key_secret: Option<Vec<u8>>,
    webhook_secret: Option<Vec<u8>>,
}

fn verify_hex(secret: Option<&[u8]>, payload: &[u8], signature_hex: &str) -> bool {
    let Some(secret) = secret else {
        tracing::error!("Payment signature check attempted without a configured secret");
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

impl GatewaySignatureVerifier {
    pub fn new(key_secret: Option<&str>, webhook_secret: Option<&str>) -> Self {
        GatewaySignatureVerifier {
            key_secret: key_secret.map(|s| s.as_bytes().to_vec()),
            webhook_secret: webhook_secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn verify_webhook(&self, body: &[u8], signature_hex: &str) -> bool {
        verify_hex(self.webhook_secret.as_deref(), body, signature_hex)
    }
}

impl PaymentVerifier for GatewaySignatureVerifier {
    fn verify_confirmation(&self, confirmation: &PaymentConfirmation) -> bool {
        let payload = format!("{}|{}", confirmation.order_id, confirmation.payment_id);
        verify_hex(self.key_secret.as_deref(), payload.as_bytes(), &confirmation.signature)
    }
}

#[derive(Deserialize)]
struct WebhookBody {
    event: String,
    payload: WebhookPayload,
}

#[derive(Deserialize)]
struct WebhookPayload {
    payment: WebhookPayment,
}

#[derive(Deserialize)]
struct WebhookPayment {
    entity: PaymentEntity,
}

#[derive(Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: String,
}

/// Decode a gateway webhook body:
/// `{"event": "payment.captured", "payload": {"payment": {"entity": {"id", "order_id"}}}}`.
pub fn parse_webhook_event(body: &[u8]) -> Result<PaymentEvent, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let event = value.get("event").and_then(|e| e.as_str()).unwrap_or_default();
    if event != "payment.captured" && event != "payment.failed" {
        return Ok(PaymentEvent::Ignored(event.to_string()));
    }

    let body: WebhookBody = serde_json::from_value(value)?;
    let entity = body.payload.payment.entity;
    Ok(match body.event.as_str() {
        "payment.captured" => PaymentEvent::Captured { order_id: entity.order_id, payment_id: entity.id },
        _ => PaymentEvent::Failed { order_id: entity.order_id },
    })
}

#[cfg(test)]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(signature: String) -> PaymentConfirmation {
        PaymentConfirmation { order_id: "order_1".into(), payment_id: "pay_1".into(), signature }
    }

    #[test]
    fn confirmation_signature_covers_order_and_payment() {
        let verifier = GatewaySignatureVerifier::new(Some("key"), Some("hook"));
        assert!(verifier.verify_confirmation(&confirmation(sign("key", b"order_1|pay_1"))));
        assert!(!verifier.verify_confirmation(&confirmation(sign("key", b"order_1|pay_2"))));
        assert!(!verifier.verify_confirmation(&confirmation(sign("hook", b"order_1|pay_1"))));
        assert!(!verifier.verify_confirmation(&confirmation("not-hex".into())));
    }

    #[test]
    fn missing_secret_rejects_everything() {
        let verifier = GatewaySignatureVerifier::new(None, None);
        assert!(!verifier.verify_confirmation(&confirmation(sign("", b"order_1|pay_1"))));
        assert!(!verifier.verify_webhook(b"{}", &sign("", b"{}")));
    }

    #[test]
    fn webhook_events() {
        let captured = br#"{"event":"payment.captured","payload":{"payment":{"entity":{"id":"pay_9","order_id":"order_9"}}}}"#;
        assert_eq!(
            parse_webhook_event(captured).unwrap(),
            PaymentEvent::Captured { order_id: "order_9".into(), payment_id: "pay_9".into() }
        );
        let failed = br#"{"event":"payment.failed","payload":{"payment":{"entity":{"id":"pay_9","order_id":"order_9"}}}}"#;
        assert_eq!(parse_webhook_event(failed).unwrap(), PaymentEvent::Failed { order_id: "order_9".into() });
        assert_eq!(
            parse_webhook_event(br#"{"event":"order.paid","payload":{}}"#).unwrap(),
            PaymentEvent::Ignored("order.paid".into())
        );
        assert!(parse_webhook_event(br#"{"event":"payment.captured","payload":{}}"#).is_err());
    }
}
