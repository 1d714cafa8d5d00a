//! Strategy Generator
//!
//! Produces candidate definitions for a pair from templates matched to the
//! current market condition. From the second generation on, part of the
//! batch mutates the best retained strategies, scaling the mutation by each
//! parent's adaptation rate.
//!
//! Generation is deterministic for a given (pair, condition, generation,
//! seeds) so a retried phase produces the same candidates.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{next_id, EnhancedStrategy, MarketCondition, StrategyDefinition, StrategyFamily};

/// Family templates that suit each condition, best fit first
pub fn templates_for(condition: MarketCondition) -> Vec<StrategyFamily> {
    use StrategyFamily::*;
    match condition {
        MarketCondition::TrendingUp | MarketCondition::TrendingDown => vec![
            Momentum { fast_period: 5, slow_period: 20 },
            Breakout { lookback: 20, buffer_pct: 0.001 },
            Momentum { fast_period: 10, slow_period: 30 },
            Breakout { lookback: 40, buffer_pct: 0.002 },
        ],
        MarketCondition::Ranging => vec![
            MeanReversion { lookback: 20, entry_z: 2.0 },
            RsiReversal { period: 14, oversold: 30.0, overbought: 70.0 },
            MeanReversion { lookback: 40, entry_z: 2.5 },
            RsiReversal { period: 7, oversold: 25.0, overbought: 75.0 },
        ],
        MarketCondition::Volatile => vec![
            Breakout { lookback: 30, buffer_pct: 0.005 },
            MeanReversion { lookback: 30, entry_z: 3.0 },
            RsiReversal { period: 14, oversold: 20.0, overbought: 80.0 },
            Breakout { lookback: 50, buffer_pct: 0.01 },
        ],
    }
}

#[derive(Debug, Clone)]
pub struct StrategyGenerator {
    /// Share of the batch derived from retained strategies
    pub mutation_share: f64,
    /// Ceiling on any period parameter
    pub max_period: usize,
}

impl Default for StrategyGenerator {
    fn default() -> Self {
        Self {
            mutation_share: 0.5,
            max_period: 120,
        }
    }
}

impl StrategyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate `count` candidates. `seeds` are retained strategies from
    /// earlier generations, best first.
    pub fn generate(
        &self,
        pair: &str,
        condition: MarketCondition,
        generation: u32,
        count: usize,
        seeds: &[&EnhancedStrategy],
    ) -> Vec<StrategyDefinition> {
        if count == 0 {
            return Vec::new();
        }

        let mut rng = StdRng::seed_from_u64(rng_seed(pair, condition, generation));
        let mutated = if seeds.is_empty() {
            0
        } else {
            ((count as f64 * self.mutation_share).round() as usize).clamp(1, count)
        };

        let mut families: Vec<StrategyFamily> = Vec::with_capacity(count);
        for i in 0..mutated {
            let parent = seeds[i % seeds.len()];
            let rate = parent.learning.adaptation_rate;
            families.push(self.mutate(&parent.definition.family, rate, &mut rng));
        }

        let templates = templates_for(condition);
        let mut round = 0usize;
        while families.len() < count {
            let base = &templates[round % templates.len()];
            // Later passes over the template list are jittered so the batch stays distinct
            let family = if round < templates.len() {
                base.clone()
            } else {
                self.mutate(base, 0.25, &mut rng)
            };
            families.push(family);
            round += 1;
        }

        families
            .into_iter()
            .enumerate()
            .filter(|(_, family)| family.validate().is_ok())
            .map(|(i, family)| StrategyDefinition {
                id: next_id("strat"),
                name: format!("{} g{}-{}", describe(&family), generation, i + 1),
                pair: pair.to_string(),
                family,
                generation,
                target_condition: condition,
                created_at: Utc::now(),
            })
            .collect()
    }

    /// Perturb every parameter by up to `rate` (relative), keeping the
    /// family's invariants
    pub fn mutate(&self, family: &StrategyFamily, rate: f64, rng: &mut StdRng) -> StrategyFamily {
        let rate = rate.clamp(0.01, 1.0);
        let mut scale = |v: f64| v * (1.0 + rng.gen_range(-rate..=rate));

        match family {
            StrategyFamily::Momentum { fast_period, slow_period } => {
                let fast = self.period(scale(*fast_period as f64), 2);
                let slow = self.period(scale(*slow_period as f64), fast + 1).max(fast + 1);
                StrategyFamily::Momentum { fast_period: fast, slow_period: slow }
            }
            StrategyFamily::MeanReversion { lookback, entry_z } => StrategyFamily::MeanReversion {
                lookback: self.period(scale(*lookback as f64), 5),
                entry_z: scale(*entry_z).clamp(0.5, 4.0),
            },
            StrategyFamily::Breakout { lookback, buffer_pct } => StrategyFamily::Breakout {
                lookback: self.period(scale(*lookback as f64), 5),
                buffer_pct: scale(*buffer_pct).clamp(0.0, 0.05),
            },
            StrategyFamily::RsiReversal { period, oversold, overbought } => {
                let oversold = scale(*oversold).clamp(5.0, 45.0);
                let overbought = scale(*overbought).clamp(55.0, 95.0);
                StrategyFamily::RsiReversal {
                    period: self.period(scale(*period as f64), 3),
                    oversold,
                    overbought,
                }
            }
        }
    }

    fn period(&self, v: f64, min: usize) -> usize {
        (v.round().max(0.0) as usize).clamp(min, self.max_period.max(min))
    }
}

fn describe(family: &StrategyFamily) -> String {
    match family {
        StrategyFamily::Momentum { fast_period, slow_period } => {
            format!("momentum {}/{}", fast_period, slow_period)
        }
        StrategyFamily::MeanReversion { lookback, entry_z } => {
            format!("mean-reversion {}@{:.2}z", lookback, entry_z)
        }
        StrategyFamily::Breakout { lookback, buffer_pct } => {
            format!("breakout {}+{:.2}%", lookback, buffer_pct * 100.0)
        }
        StrategyFamily::RsiReversal { period, oversold, overbought } => {
            format!("rsi {} {:.0}/{:.0}", period, oversold, overbought)
        }
    }
}

fn rng_seed(pair: &str, condition: MarketCondition, generation: u32) -> u64 {
    // FNV-1a over the inputs
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let condition_tag = condition as u8;
    for byte in pair.bytes().chain(std::iter::once(condition_tag)).chain(generation.to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families(defs: &[StrategyDefinition]) -> Vec<StrategyFamily> {
        defs.iter().map(|d| d.family.clone()).collect()
    }

    #[test]
    fn test_first_generation_uses_templates() {
        let gen = StrategyGenerator::new();
        let defs = gen.generate("BTC_USDT", MarketCondition::Ranging, 0, 4, &[]);
        assert_eq!(defs.len(), 4);
        assert_eq!(families(&defs), templates_for(MarketCondition::Ranging));
        assert!(defs.iter().all(|d| d.pair == "BTC_USDT" && d.generation == 0));
    }

    #[test]
    fn test_zero_count() {
        assert!(StrategyGenerator::new()
            .generate("BTC_USDT", MarketCondition::Volatile, 0, 0, &[])
            .is_empty());
    }

    #[test]
    fn test_larger_batch_stays_valid() {
        let defs = StrategyGenerator::new().generate("ETH_USDT", MarketCondition::TrendingUp, 0, 10, &[]);
        assert_eq!(defs.len(), 10);
        assert!(defs.iter().all(|d| d.family.validate().is_ok()));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let gen = StrategyGenerator::new();
        let a = gen.generate("BTC_USDT", MarketCondition::Volatile, 3, 8, &[]);
        let b = gen.generate("BTC_USDT", MarketCondition::Volatile, 3, 8, &[]);
        assert_eq!(families(&a), families(&b));
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_seeds_are_mutated_within_family() {
        let gen = StrategyGenerator::new();
        let parent_def = gen.generate("BTC_USDT", MarketCondition::TrendingUp, 0, 1, &[]).remove(0);
        let parent = EnhancedStrategy::new(parent_def);

        let defs = gen.generate("BTC_USDT", MarketCondition::Ranging, 1, 4, &[&parent]);
        assert_eq!(defs.len(), 4);
        assert_eq!(defs[0].family.name(), "momentum");
        assert_eq!(defs[1].family.name(), "momentum");
        assert_eq!(defs[2].family.name(), "mean-reversion");
    }
}
