// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Importance sampling of alternatives from a large universe (e.g., parcels for a destination
//! choice).
//!
//! Candidates are drawn without replacement with probabilities proportional to their weight
//! (randomized systematic sampling). Each [SampleItem] carries the log of its inclusion
//! probability: subtracting it from the utility of the alternative corrects the choice
//! probabilities for the fact that only a sample of the universe is enumerated.
use rand::prelude::*;

use crate::ChoiceError;

/// A candidate of the sampling universe.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Identifier of the entity (e.g., parcel id).
    pub entity_id: u64,
    /// Non-negative sampling weight (e.g., size of the parcel).
    pub weight: f64,
}

impl Candidate {
    pub fn new(entity_id: u64, weight: f64) -> Self {
        Candidate { entity_id, weight }
    }
}

/// A candidate for an intermediate stop, weighted from the two ends of the trip.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StopCandidate {
    pub entity_id: u64,
    /// Sampling weight seen from the tour origin.
    pub first_weight: f64,
    /// Sampling weight seen from the trip origin.
    pub second_weight: f64,
}

/// An alternative of the sample.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SampleItem {
    /// Identifier of the entity.
    pub entity_id: u64,
    /// Probability that the entity is part of a random sample.
    pub inclusion_probability: f64,
    /// Log of the inclusion probability (0 for items with an inclusion probability of zero or
    /// one).
    pub adjustment_factor: f64,
    /// `false` if the entity could not have been sampled (forced item with a zero weight).
    pub is_available: bool,
    /// `true` if the entity is the observed choice.
    pub is_chosen: bool,
    /// `true` if the entity is the usual location of the person.
    pub is_usual: bool,
    /// `true` if the entity was randomly drawn (`false` for forced items).
    pub is_drawn: bool,
}

impl SampleItem {
    fn new(entity_id: u64, inclusion_probability: f64, is_drawn: bool) -> Self {
        let is_available = inclusion_probability > 0.0;
        SampleItem {
            entity_id,
            inclusion_probability,
            adjustment_factor: if is_available {
                inclusion_probability.ln()
            } else {
                0.0
            },
            is_available,
            is_chosen: false,
            is_usual: false,
            is_drawn,
        }
    }

    /// Returns the term to add to the utility of the alternative to correct for sampling.
    pub fn utility_correction(&self) -> f64 {
        -self.adjustment_factor
    }
}

/// Request for a sample of alternatives.
#[derive(Copy, Clone, Debug)]
pub struct SampleRequest<'a> {
    /// Universe of candidates.
    pub universe: &'a [Candidate],
    /// Number of candidates to draw.
    pub sample_size: usize,
    /// Entity which can never be drawn (e.g., the origin of the tour).
    pub origin: Option<u64>,
    /// Observed choice, always part of the sample.
    pub chosen: Option<u64>,
    /// Usual location, always part of the sample.
    pub usual: Option<u64>,
}

impl<'a> SampleRequest<'a> {
    pub fn new(universe: &'a [Candidate], sample_size: usize) -> Self {
        SampleRequest {
            universe,
            sample_size,
            origin: None,
            chosen: None,
            usual: None,
        }
    }

    pub fn with_origin(mut self, origin: u64) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_chosen(mut self, chosen: u64) -> Self {
        self.chosen = Some(chosen);
        self
    }

    pub fn with_usual(mut self, usual: u64) -> Self {
        self.usual = Some(usual);
        self
    }
}

/// Request for a sample of intermediate-stop locations.
///
/// Half of the sample is drawn with the weights seen from the tour origin and the other half
/// with the weights seen from the trip origin.
#[derive(Copy, Clone, Debug)]
pub struct StopSampleRequest<'a> {
    pub candidates: &'a [StopCandidate],
    pub sample_size: usize,
    /// Entities which can never be drawn (e.g., the two origins).
    pub excluded: &'a [u64],
    pub chosen: Option<u64>,
}

/// Weighted sampler of alternatives, without replacement.
#[derive(Copy, Clone, Debug, Default)]
pub struct AlternativeSampler;

impl AlternativeSampler {
    /// Creates a sampler for which only candidates with a positive weight can be drawn.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a sample of alternatives.
    ///
    /// The result is sorted by entity id. It contains `sample_size` drawn items (or all the
    /// eligible candidates if there are not enough of them), plus the chosen and usual entities
    /// if they were not drawn.
    ///
    /// # Example
    ///
    /// ```
    /// use choice::{AlternativeSampler, Candidate, RandomStream, SampleRequest};
    ///
    /// let universe: Vec<_> = (0..10_000).map(|i| Candidate::new(i, 1.0)).collect();
    /// let mut stream = RandomStream::from_seed(1);
    /// let sample = AlternativeSampler::new()
    ///     .sample(&SampleRequest::new(&universe, 50), &mut stream)
    ///     .unwrap();
    /// assert_eq!(sample.len(), 50);
    /// assert!((sample[0].adjustment_factor - (50.0f64 / 10_000.0).ln()).abs() < 1e-12);
    /// ```
    pub fn sample<R: Rng + ?Sized>(
        &self,
        request: &SampleRequest,
        rng: &mut R,
    ) -> Result<Vec<SampleItem>, ChoiceError> {
        if request.sample_size == 0 {
            return Err(ChoiceError::InvalidSampleSize);
        }
        let weights = self.eligible_weights(
            request.universe.iter().map(|c| (c.entity_id, c.weight)),
            request.origin.as_slice(),
        )?;
        let probabilities = inclusion_probabilities(&weights, request.sample_size);
        let drawn = systematic_draw(&probabilities, rng);
        let mut items: Vec<SampleItem> = drawn
            .iter()
            .enumerate()
            .filter(|(_, &d)| d)
            .map(|(i, _)| SampleItem::new(request.universe[i].entity_id, probabilities[i], true))
            .collect();
        let position = |entity: u64| {
            request
                .universe
                .iter()
                .position(|c| c.entity_id == entity)
                .ok_or(ChoiceError::UnknownEntity(entity))
        };
        if let Some(chosen) = request.chosen {
            let item = force(&mut items, chosen, probabilities[position(chosen)?]);
            item.is_chosen = true;
        }
        if let Some(usual) = request.usual {
            let item = force(&mut items, usual, probabilities[position(usual)?]);
            item.is_usual = true;
        }
        items.sort_by_key(|item| item.entity_id);
        Ok(items)
    }

    /// Draws a sample of intermediate-stop locations from two origins.
    ///
    /// The inclusion probability of an entity is `1 - (1 - p1) * (1 - p2)`, where `p1` and `p2`
    /// are its inclusion probabilities in the two half-samples.
    pub fn sample_two_origins<R: Rng + ?Sized>(
        &self,
        request: &StopSampleRequest,
        rng: &mut R,
    ) -> Result<Vec<SampleItem>, ChoiceError> {
        if request.sample_size == 0 {
            return Err(ChoiceError::InvalidSampleSize);
        }
        let first_size = request.sample_size.div_ceil(2);
        let second_size = request.sample_size / 2;
        let first_weights = self.eligible_weights(
            request.candidates.iter().map(|c| (c.entity_id, c.first_weight)),
            request.excluded,
        )?;
        let second_weights = self.eligible_weights(
            request.candidates.iter().map(|c| (c.entity_id, c.second_weight)),
            request.excluded,
        )?;
        let first_probabilities = inclusion_probabilities(&first_weights, first_size);
        let second_probabilities = inclusion_probabilities(&second_weights, second_size);
        let first_drawn = systematic_draw(&first_probabilities, rng);
        let second_drawn = systematic_draw(&second_probabilities, rng);
        let probabilities: Vec<f64> = first_probabilities
            .iter()
            .zip(second_probabilities.iter())
            .map(|(p1, p2)| 1.0 - (1.0 - p1) * (1.0 - p2))
            .collect();
        let mut items: Vec<SampleItem> = (0..request.candidates.len())
            .filter(|&i| first_drawn[i] || second_drawn[i])
            .map(|i| SampleItem::new(request.candidates[i].entity_id, probabilities[i], true))
            .collect();
        if let Some(chosen) = request.chosen {
            let i = request
                .candidates
                .iter()
                .position(|c| c.entity_id == chosen)
                .ok_or(ChoiceError::UnknownEntity(chosen))?;
            force(&mut items, chosen, probabilities[i]).is_chosen = true;
        }
        items.sort_by_key(|item| item.entity_id);
        Ok(items)
    }

    /// Returns the weights of the candidates, with a zero weight for the candidates that cannot
    /// be drawn.
    fn eligible_weights(
        &self,
        candidates: impl Iterator<Item = (u64, f64)>,
        excluded: &[u64],
    ) -> Result<Vec<f64>, ChoiceError> {
        candidates
            .map(|(entity, weight)| {
                if !weight.is_finite() || weight < 0.0 {
                    Err(ChoiceError::InvalidWeight { entity, weight })
                } else if excluded.contains(&entity) {
                    Ok(0.0)
                } else {
                    Ok(weight)
                }
            })
            .collect()
    }
}

/// Adds a forced item to the sample (if it was not drawn) and returns it.
fn force(items: &mut Vec<SampleItem>, entity_id: u64, probability: f64) -> &mut SampleItem {
    let k = match items.iter().position(|item| item.entity_id == entity_id) {
        Some(k) => k,
        None => {
            items.push(SampleItem::new(entity_id, probability, false));
            items.len() - 1
        }
    };
    &mut items[k]
}

/// Returns the inclusion probabilities of a sample of size `k` drawn without replacement with
/// probabilities proportional to the weights.
///
/// Candidates whose probability `k * w / W` would exceed one are included with certainty and the
/// rest of the sample is allocated to the other candidates. If there are no more than `k`
/// candidates with a positive weight, they all have an inclusion probability of one. The
/// probabilities sum to `min(k, number of candidates with positive weight)`.
pub fn inclusion_probabilities(weights: &[f64], k: usize) -> Vec<f64> {
    let nb_eligible = weights.iter().filter(|&&w| w > 0.0).count();
    if k >= nb_eligible {
        return weights
            .iter()
            .map(|&w| if w > 0.0 { 1.0 } else { 0.0 })
            .collect();
    }
    let mut certain = vec![false; weights.len()];
    let mut remaining = k;
    loop {
        let total: f64 = weights
            .iter()
            .zip(certain.iter())
            .filter(|(_, &c)| !c)
            .map(|(&w, _)| w)
            .sum();
        let mut nb_new = 0;
        for (w, c) in weights.iter().zip(certain.iter_mut()) {
            if !*c && *w > 0.0 && remaining as f64 * w >= total {
                *c = true;
                nb_new += 1;
            }
        }
        // There is always at least one uncertain candidate left because k < nb_eligible.
        remaining -= nb_new;
        if nb_new == 0 {
            return weights
                .iter()
                .zip(certain.iter())
                .map(|(&w, &c)| {
                    if c {
                        1.0
                    } else {
                        remaining as f64 * w / total
                    }
                })
                .collect();
        }
    }
}

/// Randomized systematic sampling: the uncertain candidates are shuffled and laid on a line, each
/// covering a length equal to its inclusion probability; the candidates covering the points
/// `u, u + 1, u + 2, ...` are drawn.
fn systematic_draw<R: Rng + ?Sized>(probabilities: &[f64], rng: &mut R) -> Vec<bool> {
    let mut drawn: Vec<bool> = probabilities.iter().map(|&p| p >= 1.0).collect();
    let mut order: Vec<usize> = (0..probabilities.len())
        .filter(|&i| probabilities[i] > 0.0 && probabilities[i] < 1.0)
        .collect();
    let nb_random = order
        .iter()
        .map(|&i| probabilities[i])
        .sum::<f64>()
        .round() as usize;
    order.shuffle(rng);
    let mut next_point: f64 = rng.gen();
    let mut cum_prob = 0.0;
    let mut count = 0;
    for &i in &order {
        if count == nb_random {
            break;
        }
        cum_prob += probabilities[i];
        if cum_prob > next_point {
            drawn[i] = true;
            count += 1;
            next_point += 1.0;
        }
    }
    // Rounding errors can leave the last point uncovered.
    for &i in order.iter().rev() {
        if count >= nb_random {
            break;
        }
        if !drawn[i] {
            drawn[i] = true;
            count += 1;
        }
    }
    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::RandomStream;

    fn uniform_universe(n: u64) -> Vec<Candidate> {
        (0..n).map(|i| Candidate::new(i, 1.0)).collect()
    }

    #[test]
    fn uniform_sample_test() {
        let universe = uniform_universe(10_000);
        let mut stream = RandomStream::from_seed(2024);
        let sample = AlternativeSampler::new()
            .sample(&SampleRequest::new(&universe, 50), &mut stream)
            .unwrap();
        assert_eq!(sample.len(), 50);
        let expected = (50.0f64 / 10_000.0).ln();
        for item in &sample {
            assert!((item.adjustment_factor - expected).abs() < 1e-12);
            assert!((item.utility_correction() + expected).abs() < 1e-12);
            assert!(item.is_available && item.is_drawn && !item.is_chosen);
        }
        // Sorted and without duplicates.
        assert!(sample.windows(2).all(|w| w[0].entity_id < w[1].entity_id));
    }

    #[test]
    fn forced_chosen_test() {
        let universe = uniform_universe(1_000);
        for seed in 0..50 {
            let mut stream = RandomStream::from_seed(seed);
            let request = SampleRequest::new(&universe, 20).with_chosen(777);
            let sample = AlternativeSampler::new()
                .sample(&request, &mut stream)
                .unwrap();
            let chosen: Vec<_> = sample.iter().filter(|s| s.is_chosen).collect();
            assert_eq!(chosen.len(), 1);
            assert_eq!(chosen[0].entity_id, 777);
            // The chosen item is corrected like the others.
            assert!((chosen[0].adjustment_factor - (0.02f64).ln()).abs() < 1e-12);
            assert!(sample.len() == 20 || sample.len() == 21);
            assert_eq!(sample.len() == 21, !chosen[0].is_drawn);
        }
    }

    #[test]
    fn zero_weight_test() {
        let mut universe = uniform_universe(100);
        universe[3].weight = 0.0;
        universe[4].weight = 0.0;
        for seed in 0..200 {
            let mut stream = RandomStream::from_seed(seed);
            let request = SampleRequest::new(&universe, 30).with_chosen(4);
            let sample = AlternativeSampler::new()
                .sample(&request, &mut stream)
                .unwrap();
            assert!(sample.iter().all(|s| s.entity_id != 3));
            let forced = sample.iter().find(|s| s.entity_id == 4).unwrap();
            assert!(forced.is_chosen && !forced.is_available && !forced.is_drawn);
            assert_eq!(forced.adjustment_factor, 0.0);
        }
    }

    #[test]
    fn small_universe_test() {
        let universe = vec![
            Candidate::new(1, 5.0),
            Candidate::new(2, 0.0),
            Candidate::new(3, 1.0),
        ];
        let mut stream = RandomStream::from_seed(1);
        let sample = AlternativeSampler::new()
            .sample(&SampleRequest::new(&universe, 10), &mut stream)
            .unwrap();
        let ids: Vec<u64> = sample.iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(sample.iter().all(|s| s.adjustment_factor == 0.0));
        assert!(sample.iter().all(|s| s.inclusion_probability == 1.0));
    }

    #[test]
    fn origin_and_usual_test() {
        let universe = uniform_universe(10);
        for seed in 0..100 {
            let mut stream = RandomStream::from_seed(seed);
            let request = SampleRequest::new(&universe, 5)
                .with_origin(0)
                .with_usual(9)
                .with_chosen(9);
            let sample = AlternativeSampler::new()
                .sample(&request, &mut stream)
                .unwrap();
            assert!(sample.iter().all(|s| s.entity_id != 0));
            let usual = sample.iter().find(|s| s.entity_id == 9).unwrap();
            assert!(usual.is_usual && usual.is_chosen);
            // The origin is not eligible: 9 candidates left.
            assert!((usual.inclusion_probability - 5.0 / 9.0).abs() < 1e-12);
        }
    }

    #[test]
    fn invalid_request_test() {
        let mut universe = uniform_universe(10);
        let mut stream = RandomStream::from_seed(1);
        let sampler = AlternativeSampler::new();
        assert_eq!(
            sampler.sample(&SampleRequest::new(&universe, 0), &mut stream),
            Err(ChoiceError::InvalidSampleSize)
        );
        assert_eq!(
            sampler.sample(&SampleRequest::new(&universe, 3).with_chosen(42), &mut stream),
            Err(ChoiceError::UnknownEntity(42))
        );
        universe[2].weight = -1.0;
        assert!(matches!(
            sampler.sample(&SampleRequest::new(&universe, 3), &mut stream),
            Err(ChoiceError::InvalidWeight { entity: 2, .. })
        ));
        universe[2].weight = f64::NAN;
        assert!(sampler
            .sample(&SampleRequest::new(&universe, 3), &mut stream)
            .is_err());
    }

    #[test]
    fn determinism_test() {
        let universe: Vec<_> = (0..500)
            .map(|i| Candidate::new(i, 1.0 + (i % 7) as f64))
            .collect();
        let request = SampleRequest::new(&universe, 25).with_origin(3);
        let a = AlternativeSampler::new()
            .sample(&request, &mut RandomStream::from_seed(99))
            .unwrap();
        let b = AlternativeSampler::new()
            .sample(&request, &mut RandomStream::from_seed(99))
            .unwrap();
        assert_eq!(a, b);
        let c = AlternativeSampler::new()
            .sample(&request, &mut RandomStream::from_seed(100))
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn inclusion_probabilities_test() {
        let probabilities = inclusion_probabilities(&[1.0, 2.0, 3.0, 4.0, 10.0], 2);
        let expected = [0.1, 0.2, 0.3, 0.4, 1.0];
        for (p, e) in probabilities.iter().zip(expected.iter()) {
            assert!((p - e).abs() < 1e-12);
        }
        // Cascading certainty.
        let probabilities = inclusion_probabilities(&[100.0, 50.0, 1.0, 1.0, 1.0, 1.0], 3);
        assert_eq!(&probabilities[..2], &[1.0, 1.0]);
        assert!((probabilities[2] - 0.25).abs() < 1e-12);
        let total: f64 = probabilities.iter().sum();
        assert!((total - 3.0).abs() < 1e-12);
        assert_eq!(inclusion_probabilities(&[0.0, 1.0], 1), vec![0.0, 1.0]);
    }

    #[test]
    fn inclusion_frequency_convergence_test() {
        let universe: Vec<_> = [1.0, 2.0, 3.0, 4.0, 10.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, &w)| Candidate::new(i as u64, w))
            .collect();
        let expected = [0.1, 0.2, 0.3, 0.4, 1.0, 0.0];
        let nb_samples = 20_000;
        let mut counts = [0usize; 6];
        let mut stream = RandomStream::from_seed(7);
        for _ in 0..nb_samples {
            let sample = AlternativeSampler::new()
                .sample(&SampleRequest::new(&universe, 2), &mut stream)
                .unwrap();
            assert_eq!(sample.len(), 2);
            for item in sample {
                counts[item.entity_id as usize] += 1;
            }
        }
        for (count, e) in counts.iter().zip(expected.iter()) {
            let frequency = *count as f64 / nb_samples as f64;
            assert!((frequency - e).abs() < 0.015, "{frequency} vs {e}");
        }
    }

    #[test]
    fn stop_sample_test() {
        let candidates: Vec<_> = (0..100)
            .map(|i| StopCandidate {
                entity_id: i,
                first_weight: if i < 50 { 1.0 } else { 0.0 },
                second_weight: 1.0,
            })
            .collect();
        let mut stream = RandomStream::from_seed(5);
        let request = StopSampleRequest {
            candidates: &candidates,
            sample_size: 10,
            excluded: &[0, 99],
            chosen: Some(60),
        };
        let sample = AlternativeSampler::new()
            .sample_two_origins(&request, &mut stream)
            .unwrap();
        assert!(sample.iter().all(|s| s.entity_id != 0 && s.entity_id != 99));
        assert!(sample.len() <= 11);
        for item in &sample {
            let p1: f64 = if item.entity_id < 50 { 5.0 / 49.0 } else { 0.0 };
            let p2 = 5.0 / 98.0;
            let expected = 1.0 - (1.0 - p1) * (1.0 - p2);
            assert!((item.inclusion_probability - expected).abs() < 1e-12);
        }
        assert!(sample.iter().any(|s| s.entity_id == 60 && s.is_chosen));
    }
}
