//! Optimal-distance selection from a partial energy landscape.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use super::model::{Composition, ReferenceEnergies, SelectionResult, TrialRecord};
use crate::config::{SelectionAlgorithm, SelectionConfig};
use crate::core::errors::{FlowError, Result};

const LOWEST_ENERGY_SENTINEL: f64 = 10_000.0;
const FIT_POINTS: usize = 100;

/// One available (distance, per-atom energy) sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub distance: f64,
    pub energy: f64,
}

/// Outcome of a selection: the published result and whether the site is
/// energetically unfavorable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub result: SelectionResult,
    pub site_count: usize,
    pub unfavorable: bool,
}

/// Zero-crossing scan over samples in ascending distance order.
///
/// Returns `(optimal_distance, lowest_energy)`, or `None` with no samples.
pub fn select_standard(samples: &[Sample], default_distance: f64) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }

    let mut lowest_energy = LOWEST_ENERGY_SENTINEL;
    let mut optimal_distance = default_distance;
    let mut first_crossing: Option<f64> = None;
    let mut second_crossing = false;

    for sample in samples {
        let energy = sample.energy;
        let crossed_back = lowest_energy < 0.0 && energy >= 0.0;
        if lowest_energy >= 0.0 && energy < 0.0 && first_crossing.is_none() {
            first_crossing = Some(sample.distance);
            optimal_distance = sample.distance;
            lowest_energy = energy;
        } else if let Some(d0) = first_crossing.filter(|_| crossed_back) {
            second_crossing = true;
            optimal_distance = (d0 + sample.distance) / 2.0;
            lowest_energy = energy;
        } else if energy < lowest_energy && first_crossing.is_none() && !second_crossing {
            lowest_energy = energy;
            optimal_distance = sample.distance;
        }
    }

    Some((optimal_distance, lowest_energy))
}

/// Least-squares quadratic `c0 + c1 d + c2 d²`
pub fn fit_quadratic(samples: &[Sample]) -> Result<[f64; 3]> {
    if samples.len() < 3 {
        return Err(FlowError::fit(format!(
            "quadratic fit needs 3 samples, got {}",
            samples.len()
        )));
    }

    let n = samples.len();
    let a = DMatrix::from_fn(n, 3, |i, j| samples[i].distance.powi(j as i32));
    let y = DVector::from_iterator(n, samples.iter().map(|s| s.energy));

    let ata = a.transpose() * &a;
    let aty = a.transpose() * y;
    let c = ata
        .lu()
        .solve(&aty)
        .ok_or_else(|| FlowError::fit("normal equations are singular"))?;

    if c.iter().any(|v| !v.is_finite()) {
        return Err(FlowError::fit("fit produced non-finite coefficients"));
    }
    Ok([c[0], c[1], c[2]])
}

/// Minimum of the fitted quadratic over a dense grid spanning the samples
pub fn select_poly_fit(samples: &[Sample]) -> Result<(f64, f64)> {
    let [c0, c1, c2] = fit_quadratic(samples)?;
    let lo = samples[0].distance;
    let hi = samples[samples.len() - 1].distance;
    let step = (hi - lo) / (FIT_POINTS - 1) as f64;

    let (distance, energy) = (0..FIT_POINTS)
        .map(|i| {
            let d = lo + step * i as f64;
            (d, c0 + c1 * d + c2 * d * d)
        })
        .fold((lo, f64::INFINITY), |best, p| if p.1 < best.1 { p } else { best });

    Ok((distance, energy))
}

/// E_ads = E − E_slab·(N − offset) − Σ count·E_ref
pub fn adsorption_energy(
    lowest_energy: f64,
    slab_energy: f64,
    site_count: usize,
    reference_site_offset: usize,
    adsorbate: &Composition,
    references: &ReferenceEnergies,
) -> f64 {
    let slab_sites = site_count as f64 - reference_site_offset as f64;
    lowest_energy - slab_energy * slab_sites - references.contribution(adsorbate)
}

/// Picks the optimal distance for one site from its trials
#[derive(Debug, Clone)]
pub struct DistanceSelector {
    config: SelectionConfig,
}

impl DistanceSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// `trials` must be in ascending distance order. Unavailable trials are
    /// skipped entirely.
    pub fn select(
        &self,
        idx: &str,
        trials: &[TrialRecord],
        slab_energy: f64,
        adsorbate: &Composition,
    ) -> Result<Selection> {
        let mut samples = Vec::with_capacity(trials.len());
        let mut site_count = None;
        for trial in trials.iter().filter(|t| t.is_available()) {
            if let (Some(energy), Some(structure)) = (trial.energy_per_atom, &trial.structure) {
                samples.push(Sample {
                    distance: trial.distance,
                    energy,
                });
                site_count = Some(structure.len());
            }
        }

        let site_count = match site_count {
            Some(n) => n,
            None => {
                return Err(FlowError::InsufficientSamples {
                    idx: idx.to_string(),
                })
            }
        };

        let standard = || {
            select_standard(&samples, self.config.default_distance).ok_or_else(|| {
                FlowError::InsufficientSamples {
                    idx: idx.to_string(),
                }
            })
        };
        let (optimal_distance, lowest_energy) = match self.config.algorithm {
            SelectionAlgorithm::Standard => standard()?,
            SelectionAlgorithm::PolyFit if samples.len() < 3 => {
                warn!(idx, samples = samples.len(), "Too few samples to fit, using zero-crossing scan");
                standard()?
            }
            SelectionAlgorithm::PolyFit => select_poly_fit(&samples)?,
        };

        let adsorption_energy = adsorption_energy(
            lowest_energy,
            slab_energy,
            site_count,
            self.config.reference_site_offset,
            adsorbate,
            &self.config.reference_energies,
        );
        debug!(
            idx,
            optimal_distance, lowest_energy, adsorption_energy, "Selected optimal distance"
        );

        Ok(Selection {
            result: SelectionResult {
                optimal_distance,
                lowest_energy,
                adsorption_energy,
            },
            site_count,
            unfavorable: adsorption_energy > self.config.unfavorable_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adsorption::model::{Site, Structure, TrialStatus};
    use std::collections::BTreeMap;

    const DISTANCES: [f64; 5] = [0.5, 0.87, 1.25, 1.63, 2.0];

    fn samples(energies: &[f64]) -> Vec<Sample> {
        DISTANCES
            .iter()
            .zip(energies)
            .map(|(&distance, &energy)| Sample { distance, energy })
            .collect()
    }

    fn trial(distance: f64, energy_per_atom: Option<f64>, n: usize) -> TrialRecord {
        TrialRecord {
            distance,
            energy_per_atom,
            structure: energy_per_atom.map(|_| {
                Structure::new(
                    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                    (0..n).map(|_| Site::new("Pt", [0.0; 3])).collect(),
                )
            }),
            status: if energy_per_atom.is_some() {
                TrialStatus::Succeeded
            } else {
                TrialStatus::Failed
            },
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_recrossing_takes_midpoint() {
        let (d, e) = select_standard(&samples(&[0.3, 0.1, -0.2, -0.05, 0.4]), 2.0).unwrap();
        assert!(approx(d, 1.625));
        assert!(approx(e, 0.4));
    }

    #[test]
    fn test_single_crossing_takes_first_negative() {
        let (d, e) = select_standard(&samples(&[0.5, 0.2, -0.1, -0.3, -0.4]), 2.0).unwrap();
        assert!(approx(d, 1.25));
        assert!(approx(e, -0.1));
    }

    #[test]
    fn test_no_crossing_takes_minimum() {
        let (d, e) = select_standard(&samples(&[0.9, 0.7, 0.5, 0.3, 0.1]), 2.0).unwrap();
        assert!(approx(d, 2.0));
        assert!(approx(e, 0.1));

        let (d, _) = select_standard(&samples(&[0.9, 0.2, 0.5, 0.6, 0.7]), 2.0).unwrap();
        assert!(approx(d, 0.87));
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(select_standard(&[], 2.0), None);
    }

    #[test]
    fn test_missing_sample_equals_removed_distance() {
        let selector = DistanceSelector::new(SelectionConfig::default());
        let comp = BTreeMap::new();
        let with_gap = vec![
            trial(0.5, Some(0.3), 10),
            trial(0.87, None, 10),
            trial(1.25, Some(-0.2), 10),
            trial(1.63, Some(0.1), 10),
        ];
        let removed = vec![
            trial(0.5, Some(0.3), 10),
            trial(1.25, Some(-0.2), 10),
            trial(1.63, Some(0.1), 10),
        ];
        assert_eq!(
            selector.select("0_0_0", &with_gap, -5.0, &comp).unwrap(),
            selector.select("0_0_0", &removed, -5.0, &comp).unwrap()
        );
    }

    #[test]
    fn test_adsorption_energy_example() {
        let comp = BTreeMap::from([("H".to_string(), 2), ("O".to_string(), 1)]);
        let refs = ReferenceEnergies(BTreeMap::from([
            ("H".to_string(), -3.379),
            ("O".to_string(), -7.459),
        ]));
        let e = adsorption_energy(-0.2, -5.0, 10, 2, &comp, &refs);
        assert!(approx(e, 54.017));
    }

    #[test]
    fn test_unfavorable_site_is_flagged() {
        let selector = DistanceSelector::new(SelectionConfig::default());
        let comp = BTreeMap::from([("H".to_string(), 2), ("O".to_string(), 1)]);
        let trials = vec![trial(1.0, Some(-0.2), 10)];
        let selection = selector.select("0_0_0", &trials, -5.0, &comp).unwrap();

        assert!(selection.unfavorable);
        assert_eq!(selection.site_count, 10);
        assert!(approx(selection.result.optimal_distance, 1.0));
    }

    #[test]
    fn test_no_available_trials_is_insufficient() {
        let selector = DistanceSelector::new(SelectionConfig::default());
        let trials = vec![trial(1.0, None, 10), trial(2.0, None, 10)];
        let err = selector
            .select("0_1_2", &trials, -5.0, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::InsufficientSamples { ref idx } if idx == "0_1_2"));
    }

    #[test]
    fn test_non_finite_energies_are_insufficient() {
        let selector = DistanceSelector::new(SelectionConfig::default());
        let mut trials = vec![trial(1.0, Some(0.0), 10), trial(2.0, Some(0.0), 10)];
        trials[0].energy_per_atom = Some(f64::NAN);
        trials[1].energy_per_atom = Some(f64::INFINITY);

        let err = selector
            .select("0_0_0", &trials, -1.0, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::InsufficientSamples { .. }));
    }

    #[test]
    fn test_non_finite_energy_is_skipped_like_a_failure() {
        let selector = DistanceSelector::new(SelectionConfig::default());
        let mut with_nan = vec![
            trial(0.5, Some(0.3), 10),
            trial(1.0, Some(0.0), 10),
            trial(1.5, Some(-0.2), 10),
        ];
        with_nan[1].energy_per_atom = Some(f64::NAN);
        let without = vec![trial(0.5, Some(0.3), 10), trial(1.5, Some(-0.2), 10)];

        let a = selector.select("0_0_0", &with_nan, 0.0, &BTreeMap::new()).unwrap();
        let b = selector.select("0_0_0", &without, 0.0, &BTreeMap::new()).unwrap();
        assert_eq!(a, b);
        assert!(approx(a.result.optimal_distance, 1.5));
    }

    #[test]
    fn test_poly_fit_finds_parabola_minimum() {
        // e = (d - 1.3)^2 - 0.5
        let s: Vec<Sample> = DISTANCES
            .iter()
            .map(|&d| Sample {
                distance: d,
                energy: (d - 1.3) * (d - 1.3) - 0.5,
            })
            .collect();
        let [c0, c1, c2] = fit_quadratic(&s).unwrap();
        assert!(approx(c2, 1.0));
        assert!((c1 + 2.6).abs() < 1e-6);
        assert!((c0 - 1.19).abs() < 1e-6);

        let (d, e) = select_poly_fit(&s).unwrap();
        assert!((d - 1.3).abs() < 0.02);
        assert!((e + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_poly_fit_falls_back_with_few_samples() {
        let config = SelectionConfig {
            algorithm: SelectionAlgorithm::PolyFit,
            ..Default::default()
        };
        let selector = DistanceSelector::new(config);
        let trials = vec![trial(1.0, Some(0.4), 4), trial(2.0, Some(-0.1), 4)];
        let selection = selector.select("0_0_0", &trials, -1.0, &BTreeMap::new()).unwrap();
        assert!(approx(selection.result.optimal_distance, 2.0));
        assert!(approx(selection.result.lowest_energy, -0.1));
    }
}
