use proptest::prelude::*;
use qfc_core::{units, Block, PowHasher, ShardId, Transaction, DEFAULT_ASSET};

fn account() -> impl Strategy<Value = String> {
    "[a-z]{1,12}"
}

proptest! {
    #[test]
    fn prop_valid_transfers_have_positive_amount(
        sender in account(),
        recipient in account(),
        amount in 0u128..1_000_000_000_000u128,
    ) {
        let result = Transaction::with_timestamp(sender.clone(), recipient.clone(), amount, DEFAULT_ASSET, 1);
        if amount == 0 || sender == recipient {
            prop_assert!(result.is_err());
        } else {
            let tx = result.unwrap();
            prop_assert!(tx.amount() > 0);
            prop_assert_eq!(tx.validate(), Ok(()));
        }
    }

    #[test]
    fn prop_hash_ignores_signature_and_tracks_amount(
        amount in 1u128..1_000_000u128,
        nonce in any::<u64>(),
    ) {
        let tx = Transaction::with_timestamp("alice", "bob", amount, DEFAULT_ASSET, 7)
            .unwrap()
            .with_nonce(nonce);
        let bumped = Transaction::with_timestamp("alice", "bob", amount + 1, DEFAULT_ASSET, 7)
            .unwrap()
            .with_nonce(nonce);
        prop_assert_ne!(tx.hash(), bumped.hash());
    }

    #[test]
    fn prop_pow_hasher_matches_block_hash(nonce in any::<u64>(), shard in 0u32..8) {
        let tx = Transaction::with_timestamp("alice", "bob", units(1), DEFAULT_ASSET, 3).unwrap();
        let candidate = Block::candidate(ShardId(shard), 1, vec![tx], "prev".into());
        let hash = PowHasher::new(&candidate.header_material_at(2)).hash(nonce, "wind");
        let sealed = candidate.sealed(nonce, 2, "wind".into(), hash.clone());
        prop_assert_eq!(sealed.compute_hash(), hash);
    }
}
