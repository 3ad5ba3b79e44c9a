// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Reproducible random streams, seeded from the identifiers of the simulated entities.
use rand::prelude::*;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

/// Source of uniform random numbers in `[0, 1)` used to draw simulated choices.
pub trait RandomUtility {
    /// Returns the next uniform random number in `[0, 1)`.
    fn uniform01(&mut self) -> f64;
}

/// Stable identifiers from which the seed of a [RandomStream] is derived.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SeedKey {
    /// Identifier of the household.
    pub household: u64,
    /// Identifier of the person in the household (0 for household-level decisions).
    #[serde(default)]
    pub person: u64,
    /// Simulated day.
    #[serde(default)]
    pub day: u64,
    /// Sequence number of the decision (tour, trip, ...) for the entity.
    #[serde(default)]
    pub sequence: u64,
    /// Model-specific salt, so that two models do not use the same draws.
    #[serde(default)]
    pub salt: u64,
}

impl SeedKey {
    /// Creates a [SeedKey] for a household-level decision.
    pub fn household(household: u64) -> Self {
        SeedKey {
            household,
            ..Default::default()
        }
    }

    /// Returns the same key with the given salt.
    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    /// Returns the seed of the key, for a run with the given global seed.
    ///
    /// The seed only depends on the identifiers, never on the order in which entities are
    /// simulated.
    pub fn seed(&self, run_seed: u64) -> u64 {
        [
            self.household,
            self.person,
            self.day,
            self.sequence,
            self.salt,
        ]
        .into_iter()
        .fold(mix(run_seed), |h, x| mix(h ^ x))
    }
}

/// SplitMix64 finalizer.
fn mix(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Returns a salt derived from a model name (FNV-1a hash), stable across runs and platforms.
pub fn salt_from_name(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic random stream of one decision.
///
/// The stream is used both to sample alternatives and to draw the simulated choice.
#[derive(Clone, Debug)]
pub struct RandomStream {
    seed: u64,
    rng: XorShiftRng,
}

impl RandomStream {
    /// Creates a [RandomStream] from a seed.
    pub fn from_seed(seed: u64) -> Self {
        RandomStream {
            seed,
            rng: XorShiftRng::seed_from_u64(seed),
        }
    }

    /// Creates the [RandomStream] of the given entity.
    pub fn new(key: &SeedKey, run_seed: u64) -> Self {
        Self::from_seed(key.seed(run_seed))
    }

    /// Returns the seed of the stream.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomUtility for RandomStream {
    fn uniform01(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

impl RngCore for RandomStream {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}
