//! Combinatorial searches for the transform taking one star list onto
//! another.
//!
//! The entry points assume fluxes are actual fluxes (brighter star, higher
//! flux) but only rely on the ordering, never on values: both lists are
//! considered brightest-first and truncated before the combinatorial stage.
//!
//! A 2-D similarity is fixed by two source-target pairs, so
//! [`match_search_rot_shift`] enumerates a bounded number of 2-of-2
//! hypotheses among the brightest stars, scores each by how many remaining
//! stars map onto the other list within tolerance, and keeps the best.
//! [`list_matchup_shift`] recovers a pure shift with a histogram, and
//! [`list_match_refine`] polishes any initial guess into a polynomial map.

use std::collections::HashMap;
use std::fmt;

use ahash::RandomState;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::constants::{REFINE_IMPROVEMENT, REFINE_SHRINK};
use crate::starcal_errors::StarcalError;
use crate::stars::{brightest, BaseStarList, Point};
use crate::transforms::{compose, LinearTransform, Transform, TransformIdentity};

use super::fast_finder::FastFinder;
use super::star_match::{StarMatch, StarMatchList};

/// Maximum number of collect/fit passes performed by
/// [`list_match_refine`].
const MAX_REFINE_PASSES: usize = 10;

/// Parameters of the combinatorial searches.
///
/// All cuts are configuration, not source constants. `algorithm` selects
/// the bootstrap used by [`list_match_combinatorial`]: `1` assumes a pure
/// shift and uses the histogram estimator, `2` (default) runs the full
/// similarity search including flipped solutions.
#[derive(Debug, Clone)]
pub struct MatchConditions {
    /// Brightest-star counts kept from each list.
    pub n_stars_list1: usize,
    pub n_stars_list2: usize,
    /// Cap on 2-star hypotheses drawn from each list.
    pub max_trial_count: usize,
    /// Match tolerance in units of the list's neighbour-separation scale.
    pub n_sigmas: f64,
    /// Largest acceptable translation of a hypothesis.
    pub max_shift_x: f64,
    pub max_shift_y: f64,
    /// Expected list2/list1 scale and its acceptance half-width.
    pub size_ratio: f64,
    pub delta_size_ratio: f64,
    /// Minimum matched fraction of the smaller truncated list.
    pub min_match_ratio: f64,
    /// Polynomial order ceiling used by the combinatorial→refine wrapper.
    pub max_refine_order: usize,
    pub algorithm: u8,
}

impl Default for MatchConditions {
    fn default() -> Self {
        MatchConditions {
            n_stars_list1: 70,
            n_stars_list2: 70,
            max_trial_count: 4,
            n_sigmas: 3.0,
            max_shift_x: 50.0,
            max_shift_y: 50.0,
            size_ratio: 1.0,
            delta_size_ratio: 0.1,
            min_match_ratio: 1.0 / 3.0,
            max_refine_order: 3,
            algorithm: 2,
        }
    }
}

impl MatchConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> MatchConditionsBuilder {
        MatchConditionsBuilder::new()
    }

    pub fn min_size_ratio(&self) -> f64 {
        self.size_ratio - self.delta_size_ratio
    }

    pub fn max_size_ratio(&self) -> f64 {
        self.size_ratio + self.delta_size_ratio
    }
}

impl fmt::Display for MatchConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Match conditions")?;
            writeln!(f, "----------------")?;
            writeln!(f, "  n_stars          : {} / {}", self.n_stars_list1, self.n_stars_list2)?;
            writeln!(f, "  max_trial_count  : {}", self.max_trial_count)?;
            writeln!(f, "  n_sigmas         : {:.2}", self.n_sigmas)?;
            writeln!(f, "  max_shift        : ({:.1}, {:.1})", self.max_shift_x, self.max_shift_y)?;
            writeln!(
                f,
                "  size_ratio       : {:.3} ± {:.3}",
                self.size_ratio, self.delta_size_ratio
            )?;
            writeln!(f, "  min_match_ratio  : {:.3}", self.min_match_ratio)?;
            writeln!(f, "  max_refine_order : {}", self.max_refine_order)?;
            write!(f, "  algorithm        : {}", self.algorithm)
        } else {
            write!(
                f,
                "MatchConditions(n={}x{}, trials={}, nsig={:.1}, shift=({:.0},{:.0}), ratio={:.2}±{:.2}, min_match={:.2}, algo={})",
                self.n_stars_list1,
                self.n_stars_list2,
                self.max_trial_count,
                self.n_sigmas,
                self.max_shift_x,
                self.max_shift_y,
                self.size_ratio,
                self.delta_size_ratio,
                self.min_match_ratio,
                self.algorithm
            )
        }
    }
}

/// Builder for [`MatchConditions`], with validation.
#[derive(Debug, Clone, Default)]
pub struct MatchConditionsBuilder {
    conditions: MatchConditions,
}

impl MatchConditionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_stars_list1(mut self, v: usize) -> Self {
        self.conditions.n_stars_list1 = v;
        self
    }
    pub fn n_stars_list2(mut self, v: usize) -> Self {
        self.conditions.n_stars_list2 = v;
        self
    }
    pub fn max_trial_count(mut self, v: usize) -> Self {
        self.conditions.max_trial_count = v;
        self
    }
    pub fn n_sigmas(mut self, v: f64) -> Self {
        self.conditions.n_sigmas = v;
        self
    }
    pub fn max_shift_x(mut self, v: f64) -> Self {
        self.conditions.max_shift_x = v;
        self
    }
    pub fn max_shift_y(mut self, v: f64) -> Self {
        self.conditions.max_shift_y = v;
        self
    }
    pub fn size_ratio(mut self, v: f64) -> Self {
        self.conditions.size_ratio = v;
        self
    }
    pub fn delta_size_ratio(mut self, v: f64) -> Self {
        self.conditions.delta_size_ratio = v;
        self
    }
    pub fn min_match_ratio(mut self, v: f64) -> Self {
        self.conditions.min_match_ratio = v;
        self
    }
    pub fn max_refine_order(mut self, v: usize) -> Self {
        self.conditions.max_refine_order = v;
        self
    }
    pub fn algorithm(mut self, v: u8) -> Self {
        self.conditions.algorithm = v;
        self
    }

    pub fn build(self) -> Result<MatchConditions, StarcalError> {
        let c = &self.conditions;
        if c.n_stars_list1 < 2 || c.n_stars_list2 < 2 {
            return Err(StarcalError::InvalidMatchConditions(
                "n_stars_list1 and n_stars_list2 must be >= 2".into(),
            ));
        }
        if c.max_trial_count == 0 {
            return Err(StarcalError::InvalidMatchConditions(
                "max_trial_count must be >= 1".into(),
            ));
        }
        if !(c.n_sigmas > 0.0) {
            return Err(StarcalError::InvalidMatchConditions(
                "n_sigmas must be > 0".into(),
            ));
        }
        if c.max_shift_x < 0.0 || c.max_shift_y < 0.0 {
            return Err(StarcalError::InvalidMatchConditions(
                "shift bounds must be non-negative".into(),
            ));
        }
        if !(c.delta_size_ratio >= 0.0) || !(c.size_ratio > c.delta_size_ratio) {
            return Err(StarcalError::InvalidMatchConditions(
                "require 0 <= delta_size_ratio < size_ratio".into(),
            ));
        }
        if !(c.min_match_ratio > 0.0 && c.min_match_ratio <= 1.0) {
            return Err(StarcalError::InvalidMatchConditions(
                "min_match_ratio must lie in (0, 1]".into(),
            ));
        }
        if !(1..=2).contains(&c.algorithm) {
            return Err(StarcalError::InvalidMatchConditions(
                "algorithm must be 1 (shift) or 2 (similarity)".into(),
            ));
        }
        Ok(self.conditions)
    }
}

/// Median nearest-neighbour separation of a list (its natural distance
/// scale). Returns `None` for fewer than two stars.
pub(crate) fn median_nn_separation(list: &BaseStarList) -> Option<f64> {
    if list.len() < 2 {
        return None;
    }
    let finder = FastFinder::new(list);
    // generous radius: the bounding-box diagonal always contains the NN
    let (mut xmin, mut xmax, mut ymin, mut ymax) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for s in list {
        xmin = xmin.min(s.pos.x);
        xmax = xmax.max(s.pos.x);
        ymin = ymin.min(s.pos.y);
        ymax = ymax.max(s.pos.y);
    }
    let diagonal = ((xmax - xmin).powi(2) + (ymax - ymin).powi(2)).sqrt().max(1.0);
    let mut dists: Vec<f64> = list
        .iter()
        .filter_map(|s| {
            let (_, second) = finder.second_closest(&s.pos, diagonal, None);
            second.map(|k| s.pos.dist(&list[k].pos))
        })
        .collect();
    if dists.is_empty() {
        return None;
    }
    dists.sort_by(|a, b| a.partial_cmp(b).expect("non-finite separation"));
    Some(dists[dists.len() / 2])
}

/// One scored similarity hypothesis.
struct Hypothesis {
    count: usize,
    residual2: f64,
    scale_dev: f64,
    transform: LinearTransform,
}

impl Hypothesis {
    /// Tie-break: match count, then total residual, then |scale − 1|.
    fn better_than(&self, other: &Hypothesis) -> bool {
        if self.count != other.count {
            return self.count > other.count;
        }
        if self.residual2 != other.residual2 {
            return self.residual2 < other.residual2;
        }
        self.scale_dev < other.scale_dev
    }
}

/// Shared implementation of the combinatorial similarity search over the
/// requested reflection parities.
fn search_similarity(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
    parities: &[bool],
) -> Option<StarMatchList> {
    let l1 = brightest(list1, conditions.n_stars_list1);
    let l2 = brightest(list2, conditions.n_stars_list2);
    if l1.len() < 2 || l2.len() < 2 {
        warn!("combinatorial match needs at least 2 stars per list");
        return None;
    }
    let finder = FastFinder::new(&l2);
    let nn_scale = median_nn_separation(&l2)?;
    let tolerance = conditions.n_sigmas * nn_scale / 10.0;
    debug!(nn_scale, tolerance, "similarity search tolerance");

    // bounded hypothesis pools: unordered bright pairs from list1, both
    // orientations from list2
    let pairs1: Vec<(usize, usize)> = (0..l1.len())
        .tuple_combinations()
        .take(conditions.max_trial_count)
        .collect();
    let pairs2: Vec<(usize, usize)> = (0..l2.len())
        .tuple_combinations()
        .flat_map(|(a, b)| [(a, b), (b, a)])
        .take(conditions.max_trial_count)
        .collect();

    let mut best: Option<Hypothesis> = None;
    for &flipped in parities {
        for &(i, j) in &pairs1 {
            let a = &l1[i].pos;
            let b = &l1[j].pos;
            let base = a.dist(b);
            if base <= 0.0 {
                continue;
            }
            for &(k, l) in &pairs2 {
                let ap = &l2[k].pos;
                let bp = &l2[l].pos;
                let ratio = ap.dist(bp) / base;
                if ratio < conditions.min_size_ratio() || ratio > conditions.max_size_ratio() {
                    continue;
                }
                let Some(t) = LinearTransform::from_two_pairs(a, b, ap, bp, flipped) else {
                    continue;
                };
                if t.dx.abs() > conditions.max_shift_x || t.dy.abs() > conditions.max_shift_y {
                    continue;
                }
                let mut count = 0usize;
                let mut residual2 = 0.0;
                for s in &l1 {
                    let mapped = t.apply(&s.pos);
                    if let Some(m) = finder.find_closest(&mapped, tolerance, None) {
                        count += 1;
                        residual2 += mapped.dist2(&l2[m].pos);
                    }
                }
                let hypothesis = Hypothesis {
                    count,
                    residual2,
                    scale_dev: (t.scale() - 1.0).abs(),
                    transform: t,
                };
                if best.as_ref().is_none_or(|b| hypothesis.better_than(b)) {
                    best = Some(hypothesis);
                }
            }
        }
    }

    let best = best?;
    let smaller = l1.len().min(l2.len());
    if (best.count as f64) < conditions.min_match_ratio * smaller as f64 {
        warn!(
            count = best.count,
            smaller, "combinatorial match below minimum ratio"
        );
        return None;
    }
    info!(
        count = best.count,
        scale = best.transform.scale(),
        "similarity hypothesis accepted"
    );

    // assemble matches over the full lists and refit the transform on them
    let mut matches = list_match_collect(list1, list2, &best.transform, tolerance);
    let pairs: Vec<(Point, Point)> = matches
        .matches()
        .iter()
        .map(|m| (m.point1, m.point2))
        .collect();
    match LinearTransform::fit(&pairs) {
        Ok(refit) => {
            matches.set_transform(Box::new(refit));
            matches.compute_residuals();
        }
        Err(e) => warn!("inlier refit failed, keeping hypothesis transform: {e}"),
    }
    Some(matches)
}

/// Search for a shift + rotation (+ scale within the configured ratio
/// window) mapping `list1` onto `list2`. Returns `None` when the best
/// hypothesis matches fewer than `min_match_ratio` of the smaller list.
pub fn match_search_rot_shift(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
) -> Option<StarMatchList> {
    search_similarity(list1, list2, conditions, &[false])
}

/// Same as [`match_search_rot_shift`], also trying reflected solutions and
/// keeping the best across both parities.
pub fn match_search_rot_shift_flip(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
) -> Option<StarMatchList> {
    search_similarity(list1, list2, conditions, &[false, true])
}

/// Estimate a 2-D shift refining `guess` with a crude histogram method:
/// every pair difference within `max_shift` on both axes votes in a bin of
/// `bin_size` (default `max_shift / 100`); the peak bin, parabolically
/// interpolated over its 3×3 neighbourhood, gives the shift. Returns the
/// shift composed after `guess`, or `None` when no pair votes.
pub fn list_matchup_shift(
    list1: &BaseStarList,
    list2: &BaseStarList,
    guess: &dyn Transform,
    max_shift: f64,
    bin_size: f64,
) -> Option<Box<dyn Transform>> {
    let bin = if bin_size > 0.0 {
        bin_size
    } else {
        (max_shift / 100.0).max(f64::EPSILON)
    };
    let mut histogram: HashMap<(i64, i64), u32, RandomState> = HashMap::default();
    for s1 in list1 {
        let g = guess.apply(&s1.pos);
        for s2 in list2 {
            let dx = s2.pos.x - g.x;
            let dy = s2.pos.y - g.y;
            if dx.abs() > max_shift || dy.abs() > max_shift {
                continue;
            }
            let key = ((dx / bin).floor() as i64, (dy / bin).floor() as i64);
            *histogram.entry(key).or_insert(0) += 1;
        }
    }
    // deterministic peak: highest count, smallest key on ties
    let (&peak, &peak_count) = histogram
        .iter()
        .max_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then_with(|| kb.cmp(ka)))?;
    debug!(?peak, peak_count, bin, "shift histogram peak");

    let count_at = |kx: i64, ky: i64| *histogram.get(&(kx, ky)).unwrap_or(&0) as f64;
    let interp = |minus: f64, center: f64, plus: f64| {
        let denom = 2.0 * (2.0 * center - minus - plus);
        if denom > 0.0 {
            ((plus - minus) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    };
    let ox = interp(
        count_at(peak.0 - 1, peak.1),
        peak_count as f64,
        count_at(peak.0 + 1, peak.1),
    );
    let oy = interp(
        count_at(peak.0, peak.1 - 1),
        peak_count as f64,
        count_at(peak.0, peak.1 + 1),
    );
    let shift = LinearTransform::shift(
        (peak.0 as f64 + 0.5 + ox) * bin,
        (peak.1 as f64 + 0.5 + oy) * bin,
    );
    Some(compose(guess, &shift))
}

/// Assemble matches: transform every star of `list1` through `guess`,
/// collect the closest star of `list2` within `max_dist`, and drop
/// ambiguous pairs keeping the smallest residuals.
pub fn list_match_collect(
    list1: &BaseStarList,
    list2: &BaseStarList,
    guess: &dyn Transform,
    max_dist: f64,
) -> StarMatchList {
    let finder = FastFinder::new(list2);
    let mut matches = StarMatchList::new();
    for (i, s1) in list1.iter().enumerate() {
        let mapped = guess.apply(&s1.pos);
        if let Some(j) = finder.find_closest(&mapped, max_dist, None) {
            matches.add(StarMatch::new(i, j, s1.pos, list2[j].pos));
        }
    }
    matches.set_transform(guess.clone_box());
    matches.remove_ambiguities();
    matches
}

/// Iteratively polish `transform`: re-collect pairs at a tolerance
/// shrinking by ~1.5× per pass and re-fit a polynomial whose order is
/// raised (up to `max_order`) while the residual σ keeps improving.
pub fn list_match_refine(
    list1: &BaseStarList,
    list2: &BaseStarList,
    transform: Box<dyn Transform>,
    max_order: usize,
) -> Box<dyn Transform> {
    let Some(nn_scale) = median_nn_separation(list2) else {
        return transform;
    };
    let max_order = max_order.max(1);
    let mut cut = nn_scale / 2.0;
    let mut order = 1;
    let mut current = transform;
    let mut prev_sigma = f64::INFINITY;

    for pass in 0..MAX_REFINE_PASSES {
        let mut matches = list_match_collect(list1, list2, current.as_ref(), cut);
        if matches.is_empty() {
            break;
        }
        if matches.refine_transform(order).is_err() {
            break;
        }
        let sigma = (matches.chi2() / (2 * matches.len()) as f64).sqrt();
        debug!(pass, order, n = matches.len(), sigma, cut, "refine pass");
        current = matches.transform().clone_box();
        if sigma >= prev_sigma * (1.0 - REFINE_IMPROVEMENT) {
            if order >= max_order {
                break;
            }
            order += 1;
        }
        prev_sigma = sigma;
        cut /= REFINE_SHRINK;
    }
    current
}

/// Bootstrap an initial transform according to `conditions.algorithm`:
/// a histogram shift (1) or the full similarity search with flip (2).
pub fn list_match_combinatorial(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
) -> Option<Box<dyn Transform>> {
    match conditions.algorithm {
        1 => {
            let max_shift = conditions.max_shift_x.max(conditions.max_shift_y);
            let guess =
                list_matchup_shift(list1, list2, &TransformIdentity, max_shift, 0.0)?;
            // validate the shift the same way the similarity search does
            let nn_scale = median_nn_separation(list2)?;
            let tolerance = conditions.n_sigmas * nn_scale / 10.0;
            let matches = list_match_collect(list1, list2, guess.as_ref(), tolerance);
            let smaller = list1.len().min(list2.len());
            if (matches.len() as f64) < conditions.min_match_ratio * smaller as f64 {
                warn!(count = matches.len(), "histogram shift below minimum ratio");
                return None;
            }
            Some(guess)
        }
        _ => match_search_rot_shift_flip(list1, list2, conditions)
            .map(|m| m.transform().clone_box()),
    }
}

/// Convenience wrapper: combinatorial bootstrap, then polynomial
/// refinement at `conditions.max_refine_order`.
pub fn list_match(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
) -> Option<Box<dyn Transform>> {
    list_match_with_order(list1, list2, conditions, conditions.max_refine_order)
}

/// Same as [`list_match`] with an explicit refinement order ceiling.
pub fn list_match_with_order(
    list1: &BaseStarList,
    list2: &BaseStarList,
    conditions: &MatchConditions,
    max_order: usize,
) -> Option<Box<dyn Transform>> {
    let bootstrap = list_match_combinatorial(list1, list2, conditions)?;
    Some(list_match_refine(list1, list2, bootstrap, max_order))
}

#[cfg(test)]
mod tests {
    use crate::stars::BaseStar;

    use super::*;

    fn grid(n: usize, step: f64) -> BaseStarList {
        (0..n * n)
            .map(|k| {
                BaseStar::new(
                    (k % n) as f64 * step,
                    (k / n) as f64 * step,
                    10.0 + (k % 17) as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_builder_defaults_and_validation() {
        let c = MatchConditions::builder().build().unwrap();
        assert_eq!(c.n_stars_list1, 70);
        assert!((c.min_match_ratio - 1.0 / 3.0).abs() < 1e-15);

        assert!(MatchConditions::builder().n_sigmas(0.0).build().is_err());
        assert!(MatchConditions::builder()
            .delta_size_ratio(2.0)
            .build()
            .is_err());
        assert!(MatchConditions::builder().algorithm(7).build().is_err());
        assert!(MatchConditions::builder().min_match_ratio(1.5).build().is_err());
    }

    #[test]
    fn test_histogram_shift_on_grid() {
        let list1 = grid(10, 30.0);
        let shift = LinearTransform::shift(7.3, -4.1);
        let list2: BaseStarList = list1
            .iter()
            .map(|s| BaseStar::new(shift.apply(&s.pos).x, shift.apply(&s.pos).y, s.flux))
            .collect();
        let got = list_matchup_shift(&list1, &list2, &TransformIdentity, 15.0, 0.0).unwrap();
        let p = Point::new(100.0, 100.0);
        let moved = got.apply(&p);
        assert!((moved.x - 107.3).abs() < 0.15);
        assert!((moved.y - (100.0 - 4.1)).abs() < 0.15);
    }

    #[test]
    fn test_collect_dedups() {
        let list1 = vec![BaseStar::new(0.0, 0.0, 1.0), BaseStar::new(0.4, 0.0, 2.0)];
        let list2 = vec![BaseStar::new(0.1, 0.0, 1.0)];
        let matches = list_match_collect(&list1, &list2, &TransformIdentity, 5.0);
        // both candidates point at the same target; the closer one wins
        assert_eq!(matches.len(), 1);
        assert_eq!(matches.matches()[0].star1, 0);
    }

    #[test]
    fn test_median_nn_separation_grid() {
        let list = grid(5, 10.0);
        let nn = median_nn_separation(&list).unwrap();
        assert!((nn - 10.0).abs() < 1e-12);
    }
}
