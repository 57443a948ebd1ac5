use crate::rules::{Rule, WeightedDest};
use rand::RngCore;

/// One candidate in a weighted draw. `item` is typically a reference so the
/// selector never needs to clone the underlying rule/destination.
#[derive(Debug, Clone, Copy)]
pub struct Weighted<T> {
    pub weight: u64,
    pub item: T,
}

/// Pick one item with probability proportional to its weight (§4.6). Accepts
/// an injectable RNG so callers (and tests) can make selection deterministic.
/// Ties — and the degenerate all-zero-weight case — resolve to
/// first-appearance order (§9 Open Question 2: documented as an artifact of
/// this cumulative-weight walk, not a separate rule).
pub fn weighted_pick<T: Copy>(items: &[Weighted<T>], rng: &mut dyn RngCore) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let total: u64 = items.iter().map(|w| w.weight).sum();
    if total == 0 {
        return Some(items[0].item);
    }
    let r = rng.next_u64() % total;
    let mut acc = 0u64;
    for w in items {
        acc += w.weight;
        if r < acc {
            return Some(w.item);
        }
    }
    items.last().map(|w| w.item)
}

/// Weighted-select one matching rule among candidates, weight default 100
/// (already applied by `Rule`'s `Deserialize` default).
pub fn select_rule<'a>(rules: &[&'a Rule], rng: &mut dyn RngCore) -> Option<&'a Rule> {
    let weighted: Vec<Weighted<&'a Rule>> = rules
        .iter()
        .map(|r| Weighted {
            weight: r.weight.max(0) as u64,
            item: *r,
        })
        .collect();
    weighted_pick(&weighted, rng)
}

/// Weighted-select one destination within a rule's `destinations` /
/// `clickDestinations` list, weight default 1 and need not sum to 100.
pub fn select_destination<'a>(
    dests: &'a [WeightedDest],
    rng: &mut dyn RngCore,
) -> Option<&'a WeightedDest> {
    let weighted: Vec<Weighted<&'a WeightedDest>> = dests
        .iter()
        .map(|d| Weighted {
            weight: d.weight.max(0) as u64,
            item: d,
        })
        .collect();
    weighted_pick(&weighted, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn empty_returns_none() {
        let items: Vec<Weighted<i32>> = vec![];
        let mut rng = StepRng::new(0, 1);
        assert_eq!(weighted_pick(&items, &mut rng), None);
    }

    #[test]
    fn single_item_always_wins() {
        let items = vec![Weighted { weight: 5, item: "only" }];
        let mut rng = StepRng::new(u64::MAX / 2, 1);
        assert_eq!(weighted_pick(&items, &mut rng), Some("only"));
    }

    #[test]
    fn all_zero_weight_falls_back_to_first() {
        let items = vec![
            Weighted { weight: 0, item: "a" },
            Weighted { weight: 0, item: "b" },
        ];
        let mut rng = StepRng::new(7, 1);
        assert_eq!(weighted_pick(&items, &mut rng), Some("a"));
    }

    #[test]
    fn empirical_frequency_converges_to_weight_ratio() {
        // §8 invariant 6: empirical frequency over many draws should track
        // w_i / sum(w) within statistical tolerance.
        let items = vec![
            Weighted { weight: 3, item: "a" },
            Weighted { weight: 1, item: "b" },
        ];
        let mut rng = rand::rngs::mock::StepRng::new(0, 2_654_435_761);
        let mut counts = std::collections::HashMap::new();
        let trials = 4000;
        for _ in 0..trials {
            let pick = weighted_pick(&items, &mut rng).unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        let a = *counts.get("a").unwrap_or(&0) as f64 / trials as f64;
        assert!((a - 0.75).abs() < 0.05, "expected ~0.75, got {a}");
    }
}
