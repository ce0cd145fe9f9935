use agora_common::Amount;
use num_bigint::BigInt;

use crate::traits::TxOutput;

/// Drops outputs that would be dust and hands their value to the surviving outputs, in proportion to their size. Any
/// rounding remainder goes to the largest survivor. If nothing survives, the whole lot becomes fee.
///
/// Returns the final outputs and the extra fee. Outputs to the same address are merged first.
pub fn distribute<F>(outputs: Vec<TxOutput>, is_dust: F) -> (Vec<TxOutput>, Amount)
where F: Fn(&Amount) -> bool {
    let mut merged: Vec<TxOutput> = Vec::with_capacity(outputs.len());
    for output in outputs.into_iter().filter(|o| o.amount.is_positive()) {
        match merged.iter_mut().find(|m| m.address == output.address) {
            Some(m) => m.amount += output.amount,
            None => merged.push(output),
        }
    }
    let (mut kept, dropped): (Vec<_>, Vec<_>) = merged.into_iter().partition(|o| !is_dust(&o.amount));
    let dust: Amount = dropped.iter().map(|o| &o.amount).sum();
    if dust.is_zero() {
        return (kept, Amount::zero());
    }
    if kept.is_empty() {
        return (kept, dust);
    }
    let kept_total: Amount = kept.iter().map(|o| &o.amount).sum();
    let mut handed_out = Amount::zero();
    for output in kept.iter_mut() {
        let share: BigInt = dust.value() * output.amount.value() / kept_total.value();
        let share = Amount::new(share);
        handed_out += share.clone();
        output.amount += share;
    }
    let remainder = dust - handed_out;
    if let Some(largest) = kept.iter_mut().max_by(|a, b| a.amount.cmp(&b.amount)) {
        largest.amount += remainder;
    }
    (kept, Amount::zero())
}

#[cfg(test)]
mod test {
    use super::*;

    fn out(address: &str, amount: u64) -> TxOutput {
        TxOutput { address: address.into(), amount: Amount::from(amount) }
    }

    fn dust(a: &Amount) -> bool {
        a < &Amount::from(546u64)
    }

    #[test]
    fn nothing_to_do() {
        let (outputs, fee) = distribute(vec![out("a", 800_000), out("b", 150_000)], dust);
        assert_eq!(outputs, vec![out("a", 800_000), out("b", 150_000)]);
        assert!(fee.is_zero());
    }

    #[test]
    fn dust_is_shared_proportionally() {
        let (outputs, fee) = distribute(vec![out("a", 3000), out("b", 1000), out("m", 101)], dust);
        // 101 * 3/4 = 75, 101 * 1/4 = 25, remainder 1 to the largest
        assert_eq!(outputs, vec![out("a", 3076), out("b", 1025)]);
        assert!(fee.is_zero());
    }

    #[test]
    fn all_dust_becomes_fee() {
        let (outputs, fee) = distribute(vec![out("a", 300), out("b", 200), out("c", 0)], dust);
        assert!(outputs.is_empty());
        assert_eq!(fee, Amount::from(500u64));
    }

    #[test]
    fn same_address_outputs_merge() {
        let (outputs, _) = distribute(vec![out("a", 400), out("a", 400)], dust);
        assert_eq!(outputs, vec![out("a", 800)]);
    }
}
