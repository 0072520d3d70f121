//! Coin selection
//!
//! Greedy accumulation in encounter order (the order the ledger returned
//! the outputs, merged across the owned and derived address buckets).
//! Duplicated outpoints keep their first occurrence only.

use crate::core::fee::{calculate_tx_fee, plan_change, FeeRate, Shortfall};
use crate::core::model::Utxo;
use std::collections::HashSet;

/// Extra satoshis gathered before the exact fee is computed
pub const DEFAULT_SELECTION_BUFFER: u64 = 100;

/// Outputs chosen to fund a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Utxo>,
    pub total: u64,
    pub fee: u64,
    /// Zero when the remainder is absorbed into the fee
    pub change: u64,
}

/// First occurrence of every `(txid, vout)`
pub fn unique_utxos(utxos: &[Utxo]) -> Vec<&Utxo> {
    let mut seen = HashSet::with_capacity(utxos.len());
    utxos
        .iter()
        .filter(|u| seen.insert((u.txid.as_str(), u.vout)))
        .collect()
}

/// Owned variant of [`unique_utxos`]
pub fn dedupe_utxos(utxos: Vec<Utxo>) -> Vec<Utxo> {
    let mut seen = HashSet::with_capacity(utxos.len());
    utxos
        .into_iter()
        .filter(|u| seen.insert(u.outpoint()))
        .collect()
}

/// Select inputs paying `target` across `num_outputs` outputs
///
/// Inputs are taken until the running total reaches `target + buffer`, then
/// the exact fee decides whether more are needed. `extra_bytes` covers
/// outputs larger than a standard P2PKH output.
pub fn select_coins(
    utxos: &[Utxo],
    target: u64,
    num_outputs: usize,
    extra_bytes: u64,
    rate: FeeRate,
    buffer: u64,
) -> Result<CoinSelection, Shortfall> {
    let candidates = unique_utxos(utxos)
        .into_iter()
        .filter(|u| u.is_available());

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total = 0u64;
    for utxo in candidates {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.satoshis);

        if total >= target.saturating_add(buffer) {
            if let Ok(plan) =
                plan_change(total, target, selected.len(), num_outputs, extra_bytes, rate)
            {
                return Ok(CoinSelection {
                    selected,
                    total,
                    fee: plan.fee,
                    change: plan.change,
                });
            }
        }
    }

    if selected.is_empty() {
        return Err(Shortfall {
            required: target.saturating_add(calculate_tx_fee(1, num_outputs, extra_bytes, rate)),
            available: 0,
        });
    }

    let plan = plan_change(total, target, selected.len(), num_outputs, extra_bytes, rate)?;
    Ok(CoinSelection {
        selected,
        total,
        fee: plan.fee,
        change: plan.change,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Basket, OutPoint, SpendingStatus};

    fn utxo(txid_byte: char, vout: u32, satoshis: u64) -> Utxo {
        Utxo {
            txid: txid_byte.to_string().repeat(64),
            vout,
            satoshis,
            locking_script_hex: String::new(),
            owning_address: String::new(),
            basket: Basket::Default,
            spendable: true,
            spending_status: SpendingStatus::None,
            account_id: 1,
        }
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let mut second = utxo('a', 0, 999);
        second.basket = Basket::Derived;
        let utxos = vec![utxo('a', 0, 1_000), utxo('b', 0, 500), second, utxo('a', 1, 10)];

        let unique = dedupe_utxos(utxos.clone());
        assert_eq!(unique.len(), 3);
        assert_eq!(unique[0].satoshis, 1_000);
        assert_eq!(unique_utxos(&utxos).len(), 3);
    }

    #[test]
    fn test_selection_never_repeats_outpoint() {
        let utxos = vec![
            utxo('a', 0, 2_000),
            utxo('a', 0, 2_000),
            utxo('a', 0, 2_000),
            utxo('b', 0, 5_000),
        ];
        let selection = select_coins(&utxos, 6_000, 1, 0, FeeRate(100), 100).unwrap();

        let keys: HashSet<OutPoint> = selection.selected.iter().map(Utxo::outpoint).collect();
        assert_eq!(keys.len(), selection.selected.len());
        assert_eq!(selection.selected.len(), 2);
        assert_eq!(selection.total, 7_000);
    }

    #[test]
    fn test_selection_uses_encounter_order() {
        let utxos = vec![utxo('a', 0, 300), utxo('b', 0, 50_000), utxo('c', 0, 400)];
        let selection = select_coins(&utxos, 500, 1, 0, FeeRate(100), 100).unwrap();

        assert_eq!(selection.selected.len(), 2);
        assert_eq!(selection.selected[0].txid, utxos[0].txid);
        assert_eq!(selection.selected[1].txid, utxos[1].txid);
    }

    #[test]
    fn test_selection_skips_claimed_outputs() {
        let mut pending = utxo('a', 0, 10_000);
        pending.spending_status = SpendingStatus::Pending("ff".repeat(32));
        let mut locked = utxo('b', 0, 10_000);
        locked.spendable = false;

        let result = select_coins(&[pending, locked], 1_000, 1, 0, FeeRate(100), 100);
        assert_eq!(
            result.unwrap_err(),
            Shortfall {
                required: 1_000 + 20,
                available: 0
            }
        );
    }

    #[test]
    fn test_selection_covers_amount_plus_fee() {
        let utxos: Vec<Utxo> = (0..12).map(|i| utxo('e', i, 150 + 37 * i as u64)).collect();
        let available: u64 = utxos.iter().map(|u| u.satoshis).sum();

        for target in (50..available).step_by(97) {
            match select_coins(&utxos, target, 1, 0, FeeRate(100), 100) {
                Ok(selection) => {
                    assert!(selection.total >= target + selection.fee);
                    assert_eq!(selection.total, target + selection.fee + selection.change);
                }
                Err(shortfall) => {
                    assert_eq!(shortfall.available, available);
                    assert!(shortfall.required > available);
                }
            }
        }
    }

    #[test]
    fn test_selection_reports_shortfall() {
        let utxos = vec![utxo('a', 0, 1_000), utxo('b', 0, 1_000)];
        let shortfall = select_coins(&utxos, 5_000, 1, 0, FeeRate(100), 100).unwrap_err();
        // 2 inputs, 1 output: 340 bytes -> 34 sats
        assert_eq!(shortfall.required, 5_034);
        assert_eq!(shortfall.available, 2_000);
    }

    #[test]
    fn test_huge_target_reports_shortfall() {
        let shortfall = select_coins(&[], u64::MAX, 1, 0, FeeRate(100), 100).unwrap_err();
        assert_eq!(shortfall.required, u64::MAX);
        assert_eq!(shortfall.available, 0);

        let utxos = vec![utxo('a', 0, 1_000)];
        let shortfall = select_coins(&utxos, u64::MAX, 1, 0, FeeRate(100), 100).unwrap_err();
        assert_eq!(shortfall.required, u64::MAX);
        assert_eq!(shortfall.available, 1_000);
    }
}
