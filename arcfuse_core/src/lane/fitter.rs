// arcfuse_core/src/lane/fitter.rs

//! Adaptive arc-spline fitting of one lane segment.
//!
//! ```text
//! Associate → BaseFit → Optimize → Validate → { Done | Replicate → Optimize → Validate }
//! ```

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use super::association::{positions, LanePoint};
use super::segment::{clamp_curvature, ArcPose, ArcSegment};
use crate::config::LaneConfig;
use crate::factors::anchor::anchor_pairs;
use crate::layout::{AnchorPolicy, ANCHOR_DIM};

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e10;
const LAMBDA_MIN: f64 = 1e-12;

/// Outcome of checking every data point against its arc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    /// Total invalid points over all sub-segments.
    pub invalid_points: usize,
    /// Sub-segments with too many invalid points.
    pub invalid_subsegments: Vec<usize>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.invalid_subsegments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub replications: usize,
    /// Cost of the last full fit.
    pub cost: f64,
    pub validation: Validation,
}

/// Which part of the chain a fit residual row measures.
#[derive(Debug, Clone, Copy)]
enum Row {
    /// Circle distance of a point owned by the sub-segment.
    Point { sub: usize, point: usize },
    /// One coordinate of node `node` against a pinned point.
    Node { node: usize, point: usize, axis: usize },
}

impl Row {
    /// Whether the row depends on flat parameter `col` of an `m`-arc chain.
    fn depends_on(&self, col: usize, m: usize) -> bool {
        if col < ANCHOR_DIM {
            return true;
        }
        let (is_curvature, t) = if col < ANCHOR_DIM + m {
            (true, col - ANCHOR_DIM)
        } else {
            (false, col - ANCHOR_DIM - m)
        };
        match *self {
            Row::Point { sub, .. } => {
                if is_curvature {
                    t <= sub
                } else {
                    t < sub
                }
            }
            Row::Node { node, .. } => t < node,
        }
    }
}

/// Fits arc chains to located data points and refines their partition.
#[derive(Debug, Clone)]
pub struct ArcFitter {
    config: LaneConfig,
}

impl ArcFitter {
    pub fn new(config: LaneConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaneConfig {
        &self.config
    }

    /// Coarse fit on every `base_fit_stride`-th point plus each sub-segment's
    /// first and last point, with every node pinned to its boundary point.
    pub fn base_fit(&self, segment: &mut ArcSegment, points: &[LanePoint]) -> f64 {
        let stride = self.config.base_fit_stride.max(1);
        let mut selected: Vec<usize> = (0..points.len()).step_by(stride).collect();
        for sub in &segment.subsegments {
            selected.push(sub.bounds.0);
            selected.push(sub.bounds.1);
        }
        selected.sort_unstable();
        selected.dedup();
        self.fit_subset(segment, points, &selected, AnchorPolicy::AllBoundaries)
    }

    /// Damped fit on every data point. Only the two chain ends are pinned;
    /// internal nodes follow the points.
    pub fn fit(&self, segment: &mut ArcSegment, points: &[LanePoint]) -> f64 {
        let all: Vec<usize> = (0..points.len()).collect();
        self.fit_subset(segment, points, &all, AnchorPolicy::Endpoints)
    }

    fn fit_subset(
        &self,
        segment: &mut ArcSegment,
        points: &[LanePoint],
        selected: &[usize],
        pins: AnchorPolicy,
    ) -> f64 {
        let owners = segment.owners();
        let m = segment.len();

        let mut rows: Vec<Row> = selected
            .iter()
            .map(|&point| Row::Point {
                sub: owners[point],
                point,
            })
            .collect();
        for (node, point) in anchor_pairs(segment, pins) {
            for axis in 0..2 {
                rows.push(Row::Node { node, point, axis });
            }
        }

        let evaluate = |params: &DVector<f64>| self.residuals(params, m, &rows, points);

        let mut params = segment.parameters();
        let mut residual = evaluate(&params);
        let mut cost = 0.5 * residual.norm_squared();
        let mut lambda = LAMBDA_INIT;

        for iteration in 0..self.config.fit_max_iterations {
            let jacobian = self.jacobian(&params, &residual, m, &rows, points);
            let h = jacobian.transpose() * &jacobian;
            let g = jacobian.transpose() * &residual;

            let mut accepted = false;
            while lambda <= LAMBDA_MAX {
                let mut damped = h.clone();
                for i in 0..damped.nrows() {
                    damped[(i, i)] += lambda * h[(i, i)].max(1e-12);
                }
                let Some(cholesky) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let step = -cholesky.solve(&g);
                let trial = &params + &step;
                let trial_residual = evaluate(&trial);
                let trial_cost = 0.5 * trial_residual.norm_squared();

                if trial_cost < cost {
                    let improvement = cost - trial_cost;
                    params = trial;
                    residual = trial_residual;
                    cost = trial_cost;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);
                    accepted = true;
                    if improvement <= 1e-12 * (1.0 + cost) || step.norm() <= 1e-12 {
                        debug!(iteration, cost, "arc fit converged");
                        segment.set_parameters(&params, self.config.min_curvature);
                        return cost;
                    }
                    break;
                }
                lambda *= 10.0;
            }
            if !accepted {
                break;
            }
        }

        segment.set_parameters(&params, self.config.min_curvature);
        cost
    }

    fn residuals(&self, params: &DVector<f64>, m: usize, rows: &[Row], points: &[LanePoint]) -> DVector<f64> {
        let min_curvature = self.config.min_curvature;
        let curvature = |t: usize| clamp_curvature(params[ANCHOR_DIM + t], min_curvature);
        let length = |t: usize| params[ANCHOR_DIM + m + t].powi(2);

        let mut nodes = Vec::with_capacity(m + 1);
        let mut node = ArcPose::new(params[0], params[1], params[2]);
        nodes.push(node);
        for t in 0..m {
            node = node.advance(curvature(t), length(t));
            nodes.push(node);
        }
        let centers: Vec<_> = (0..m).map(|t| nodes[t].center(curvature(t))).collect();

        DVector::from_iterator(
            rows.len(),
            rows.iter().map(|row| match *row {
                Row::Point { sub, point } => {
                    let p = &points[point];
                    let distance = (p.position - centers[sub]).norm() - (1.0 / curvature(sub)).abs();
                    distance / p.sigma.max(f64::EPSILON)
                }
                Row::Node { node, point, axis } => {
                    let offset = nodes[node].position() - points[point].position;
                    offset[axis] / self.config.anchor_std
                }
            }),
        )
    }

    /// Forward-difference Jacobian, evaluated only where a row depends on a column.
    fn jacobian(
        &self,
        params: &DVector<f64>,
        base: &DVector<f64>,
        m: usize,
        rows: &[Row],
        points: &[LanePoint],
    ) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(rows.len(), params.len());
        for col in 0..params.len() {
            let step = self.config.jacobian_step * params[col].abs().max(1.0);
            let mut perturbed = params.clone();
            perturbed[col] += step;
            let shifted = self.residuals(&perturbed, m, rows, points);
            for (r, row) in rows.iter().enumerate() {
                if row.depends_on(col, m) {
                    jacobian[(r, col)] = (shifted[r] - base[r]) / step;
                }
            }
        }
        jacobian
    }

    /// Marks every point whose normalized squared error exceeds the chi-square
    /// threshold and every sub-segment with too many of them.
    pub fn validate(&self, segment: &mut ArcSegment, points: &[LanePoint]) -> Validation {
        let owners = segment.owners();
        for sub in &mut segment.subsegments {
            sub.invalid_points = 0;
        }

        let mut validation = Validation::default();
        for (point, &sub) in points.iter().zip(&owners) {
            let distance = segment.distance(sub, &point.position);
            let normalized = distance * distance / point.sigma.max(f64::EPSILON).powi(2);
            if normalized > self.config.chi2_threshold {
                segment.subsegments[sub].invalid_points += 1;
                validation.invalid_points += 1;
            }
        }
        validation.invalid_subsegments = segment
            .subsegments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.invalid_points >= self.config.invalid_points_per_subsegment)
            .map(|(t, _)| t)
            .collect();
        validation
    }

    /// Splits the invalid sub-segment with the most invalid points.
    ///
    /// Returns `false` when there is nothing to split or it is too small.
    pub fn replicate(&self, segment: &mut ArcSegment, points: &[LanePoint], validation: &Validation) -> bool {
        let worst = validation
            .invalid_subsegments
            .iter()
            .copied()
            .max_by_key(|&t| (segment.subsegments[t].invalid_points, std::cmp::Reverse(t)));
        match worst {
            Some(sub) => segment.split(sub, &positions(points), self.config.min_points_to_split),
            None => false,
        }
    }

    /// Splits the worst sub-segment and refits from the inherited curvatures.
    ///
    /// The split is kept only if the invalid point count does not rise;
    /// otherwise `segment` is restored and `None` returned.
    pub fn refine_once(
        &self,
        segment: &mut ArcSegment,
        points: &[LanePoint],
        before: &Validation,
    ) -> Option<(f64, Validation)> {
        let snapshot = segment.clone();
        if !self.replicate(segment, points, before) {
            debug!("invalid sub-segment too small to split");
            return None;
        }
        let cost = self.fit(segment, points);
        let after = self.validate(segment, points);
        if after.invalid_points > before.invalid_points {
            debug!(
                before = before.invalid_points,
                after = after.invalid_points,
                "split raised the invalid count; reverted"
            );
            *segment = snapshot;
            return None;
        }
        Some((cost, after))
    }

    /// Fits a segment and splits it until every sub-segment is valid, a split
    /// stops helping, or the replication budget runs out.
    pub fn fit_adaptive(&self, index: usize, segment: &mut ArcSegment, points: &[LanePoint]) -> FitReport {
        self.base_fit(segment, points);
        let mut cost = self.fit(segment, points);
        let mut validation = self.validate(segment, points);

        let mut replications = 0;
        while !validation.is_valid() && replications < self.config.max_replications {
            let Some((refit_cost, refit_validation)) = self.refine_once(segment, points, &validation) else {
                break;
            };
            replications += 1;
            info!(
                segment = index,
                subsegments = segment.len(),
                invalid_points = refit_validation.invalid_points,
                "replicated arc sub-segment"
            );
            cost = refit_cost;
            validation = refit_validation;
        }

        FitReport {
            replications,
            cost,
            validation,
        }
    }
}
