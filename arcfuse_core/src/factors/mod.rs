// arcfuse_core/src/factors/mod.rs

//! Residual/Jacobian blocks of every sensor model.
//!
//! Each builder returns residuals and Jacobian blocks already whitened by the
//! inverse Cholesky factor of the measurement covariance, so the stacked
//! system is an ordinary least-squares problem.

use nalgebra::{DMatrix, DVector};

pub mod anchor;
pub mod gnss;
pub mod inertial;
pub mod lane;
pub mod prior;
pub mod wheel;

pub use lane::{CentralDifference, ForwardDifference, LaneJacobian};

/// A dense Jacobian block placed at a column offset of the optimization vector.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianBlock {
    pub column: usize,
    pub values: DMatrix<f64>,
}

/// One whitened measurement: residual rows and the non-zero Jacobian blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorBlock {
    pub residual: DVector<f64>,
    pub blocks: Vec<JacobianBlock>,
}

impl FactorBlock {
    pub fn new(residual: DVector<f64>) -> Self {
        Self {
            residual,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, column: usize, values: DMatrix<f64>) -> Self {
        self.blocks.push(JacobianBlock { column, values });
        self
    }

    pub fn rows(&self) -> usize {
        self.residual.len()
    }

    /// Stacks several factors into one, shifting their rows.
    pub fn stack(factors: Vec<FactorBlock>) -> Self {
        let rows: usize = factors.iter().map(FactorBlock::rows).sum();
        let mut residual = DVector::zeros(rows);
        let mut blocks = Vec::new();
        let mut row = 0;
        for factor in factors {
            let height = factor.rows();
            residual.rows_mut(row, height).copy_from(&factor.residual);
            for block in factor.blocks {
                let mut values = DMatrix::zeros(rows, block.values.ncols());
                values
                    .view_mut((row, 0), (height, block.values.ncols()))
                    .copy_from(&block.values);
                blocks.push(JacobianBlock {
                    column: block.column,
                    values,
                });
            }
            row += height;
        }
        Self { residual, blocks }
    }

    /// Whitens by a full covariance. `None` when it is not positive definite.
    pub fn whitened(self, covariance: DMatrix<f64>) -> Option<Self> {
        let cholesky = covariance.cholesky()?;
        let lower = cholesky.l();
        let solve = |m: &DMatrix<f64>| lower.solve_lower_triangular(m);

        let residual_matrix = DMatrix::from_column_slice(self.rows(), 1, self.residual.as_slice());
        let residual = solve(&residual_matrix)?.column(0).into_owned();
        let blocks = self
            .blocks
            .into_iter()
            .map(|b| {
                solve(&b.values).map(|values| JacobianBlock {
                    column: b.column,
                    values,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { residual, blocks })
    }

    /// Whitens by independent per-row standard deviations.
    pub fn scaled(mut self, sigmas: &[f64]) -> Self {
        for (row, sigma) in sigmas.iter().enumerate() {
            let inv = 1.0 / sigma;
            self.residual[row] *= inv;
            for block in &mut self.blocks {
                block.values.row_mut(row).scale_mut(inv);
            }
        }
        self
    }
}

/// Copies a statically sized matrix into a dense block.
pub(crate) fn dense<const R: usize, const C: usize>(m: &nalgebra::SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}
