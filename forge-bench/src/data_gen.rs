use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Shape of the generated keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Uniform over all of u32.
    #[default]
    Uniform,
    /// Sixteen distinct values, so every pass sees long runs of equal digits.
    FewUnique,
    Sorted,
    Reversed,
    /// Only the top byte varies; the first passes see a single digit.
    HighBits,
}

impl Distribution {
    pub fn name(self) -> &'static str {
        match self {
            Distribution::Uniform => "uniform",
            Distribution::FewUnique => "few_unique",
            Distribution::Sorted => "sorted",
            Distribution::Reversed => "reversed",
            Distribution::HighBits => "high_bits",
        }
    }
}

/// Deterministic key generator seeded for reproducible runs.
pub struct DataGenerator {
    rng: StdRng,
}

impl DataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn keys(&mut self, distribution: Distribution, count: usize) -> Vec<u32> {
        match distribution {
            Distribution::Uniform => (0..count).map(|_| self.rng.gen::<u32>()).collect(),
            Distribution::FewUnique => {
                let pool: Vec<u32> = (0..16).map(|_| self.rng.gen()).collect();
                (0..count)
                    .map(|_| pool[self.rng.gen_range(0..pool.len())])
                    .collect()
            }
            Distribution::Sorted => {
                let mut keys = self.keys(Distribution::Uniform, count);
                keys.sort_unstable();
                keys
            }
            Distribution::Reversed => {
                let mut keys = self.keys(Distribution::Uniform, count);
                keys.sort_unstable_by(|a, b| b.cmp(a));
                keys
            }
            Distribution::HighBits => (0..count)
                .map(|_| (self.rng.gen::<u8>() as u32) << 24)
                .collect(),
        }
    }
}

/// Payloads that record each key's input position.
pub fn positions(count: usize) -> Vec<u32> {
    (0..count as u32).collect()
}
