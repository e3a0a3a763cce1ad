//! Property-based tests for core types.

use proptest::prelude::*;

use crate::address::{derive_address, ConsensusAccount, Hash160};
use crate::crypto::{hash, SecretKey};
use crate::evidence::ViolationEvidence;
use crate::transaction::{OutPoint, Transaction, TxId, TxInput, TxOutput};

// ============================================================================
// Strategies
// ============================================================================

fn arb_bytes20() -> impl Strategy<Value = [u8; 20]> {
    prop::array::uniform20(any::<u8>())
}

fn arb_address() -> impl Strategy<Value = Hash160> {
    arb_bytes20().prop_map(Hash160::from_bytes)
}

fn arb_secret_key() -> impl Strategy<Value = SecretKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|b| SecretKey::from_bytes(&b))
}

/// Payment with arbitrary non-negative input values and an output no larger
/// than their sum.
fn arb_payment() -> impl Strategy<Value = (SecretKey, Transaction)> {
    (
        arb_secret_key(),
        prop::collection::vec(0i64..1_000_000, 1..5),
        any::<u8>(),
        0.0f64..=1.0,
    )
        .prop_map(|(key, values, seed, spend_ratio)| {
            let inputs: Vec<TxInput> = values
                .iter()
                .enumerate()
                .map(|(i, v)| TxInput {
                    outpoint: OutPoint::new(TxId(hash(&[seed, i as u8])), i as u32),
                    value: *v,
                })
                .collect();
            let total: i64 = values.iter().sum();
            let spent = (total as f64 * spend_ratio) as i64;
            let tx = Transaction::payment(
                inputs,
                vec![TxOutput {
                    value: spent,
                    recipient: Hash160::ZERO,
                }],
                0,
            )
            .sign(&key);
            (key, tx)
        })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Address derivation always yields a consistent consensus account.
    #[test]
    fn prop_derived_account_consistent(key in arb_secret_key()) {
        let account = ConsensusAccount::from_public_key(key.public_key());
        prop_assert!(account.is_consistent());
        prop_assert_eq!(account.address, derive_address(&key.public_key()));
    }

    /// A foreign address never verifies against a key.
    #[test]
    fn prop_foreign_address_inconsistent(key in arb_secret_key(), addr in arb_address()) {
        prop_assume!(addr != derive_address(&key.public_key()));
        let account = ConsensusAccount { address: addr, public_key: key.public_key() };
        prop_assert!(!account.is_consistent());
    }

    /// Fee equals inputs minus outputs and is never negative for valid payments.
    #[test]
    fn prop_payment_fee((_key, tx) in arb_payment()) {
        prop_assert!(tx.verify_structure().is_ok());
        let fee = tx.fee().unwrap();
        prop_assert!(fee >= 0);
        prop_assert_eq!(fee, tx.input_value().unwrap() - tx.output_value().unwrap());
    }

    /// Transaction ids are stable across serialization.
    #[test]
    fn prop_tx_id_stable((_key, tx) in arb_payment()) {
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(tx.id(), decoded.id());
        prop_assert!(decoded.verify_structure().is_ok());
    }

    /// Evidence ids are a pure function of content.
    #[test]
    fn prop_evidence_id_content_addressed(addr in arb_address(), start in any::<i64>()) {
        let a = ViolationEvidence::not_broadcast(addr, start);
        let decoded = ViolationEvidence::from_canonical_bytes(&a.canonical_bytes()).unwrap();
        prop_assert_eq!(a.id(), decoded.id());
        prop_assert_ne!(a.id(), ViolationEvidence::not_broadcast(addr, start.wrapping_add(1)).id());
    }
}
