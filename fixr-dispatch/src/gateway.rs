use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use fixr_core::{GatewayOrder, PaymentAuthorization, PaymentGateway};

/// Gateway adapter that issues its own order ids and checks checkout
/// signatures of the form `sha256(secret:order_id|payment_id)`.
pub struct SandboxGateway {
    key_id: String,
    key_secret: String,
}

impl SandboxGateway {
    pub fn new(key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        }
    }

    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key_secret.as_bytes());
        hasher.update(b":");
        hasher.update(gateway_order_id.as_bytes());
        hasher.update(b"|");
        hasher.update(gateway_payment_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_order(
        &self,
        payment_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> Result<GatewayOrder, Box<dyn std::error::Error + Send + Sync>> {
        if amount <= 0 {
            return Err("order amount must be positive".into());
        }

        let order = GatewayOrder {
            order_id: format!("order_{}", payment_id.simple()),
            amount,
            currency: currency.to_string(),
        };
        info!("Gateway {} created order {} for {} {}", self.key_id, order.order_id, amount, currency);
        Ok(order)
    }

    fn verify_signature(&self, authorization: &PaymentAuthorization) -> bool {
        let expected = self.sign(&authorization.gateway_order_id, &authorization.gateway_payment_id);
        expected
            .as_bytes()
            .ct_eq(authorization.signature.trim().to_ascii_lowercase().as_bytes())
            .into()
    }
}
