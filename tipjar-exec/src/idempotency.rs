//! Idempotency Key Computation
//!
//! Charges sent to a processor carry a deterministic key so a retried or
//! reconciled attempt can never create a second charge.

use sha2::{Digest, Sha256};
use tipjar_domain::{OrderId, TransactionGroupId};

use crate::gateway::ChargePurpose;

/// Compute the processor idempotency key of a charge
///
/// Formula: SHA256(order_id + purpose + amount)
///
/// # Returns
/// Key as hex string prefixed with "ch_"
pub fn charge_idempotency_key(order_id: OrderId, purpose: &ChargePurpose, amount: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(order_id.as_bytes());
    hasher.update(purpose.tag().as_bytes());
    hasher.update(amount.to_be_bytes());

    let hash = hasher.finalize();
    format!("ch_{}", hex::encode(hash))
}

/// Compute the processor idempotency key of a refund of a transaction group
pub fn refund_idempotency_key(group_id: TransactionGroupId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"refund");
    hasher.update(group_id.as_bytes());

    format!("rf_{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn test_key_is_deterministic() {
        let order_id = Uuid::now_v7();
        let a = charge_idempotency_key(order_id, &ChargePurpose::Initial, 5000);
        let b = charge_idempotency_key(order_id, &ChargePurpose::Initial, 5000);

        assert_eq!(a, b);
        assert!(a.starts_with("ch_"));
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn test_key_depends_on_purpose_and_amount() {
        let order_id = Uuid::now_v7();
        let initial = charge_idempotency_key(order_id, &ChargePurpose::Initial, 5000);

        assert_ne!(initial, charge_idempotency_key(order_id, &ChargePurpose::Matching, 5000));
        assert_ne!(initial, charge_idempotency_key(order_id, &ChargePurpose::Initial, 5001));

        let march = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert_ne!(
            charge_idempotency_key(order_id, &ChargePurpose::Renewal(march), 5000),
            charge_idempotency_key(order_id, &ChargePurpose::Renewal(april), 5000)
        );
    }
}
