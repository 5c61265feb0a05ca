//! Canonical ICA on top of `linfa-ica`.
//!
//! 1. Every subject is masked, optionally smoothed, cleaned of confounds and
//!    standardized into a `(n_volumes, n_voxels)` matrix.
//! 2. A per-subject PCA keeps the leading spatial components.
//! 3. The stacked subject components are reduced again to the group
//!    subspace. With `do_cca` the subject components enter with unit weight,
//!    which turns this step into a canonical correlation analysis.
//! 4. FastICA unmixes the group subspace with voxels as samples, giving
//!    spatially independent maps that are thresholded and flipped so their
//!    peak is positive.

use anyhow::{Context, anyhow, ensure};
use linfa::DatasetBase;
use linfa::traits::{Fit, Predict};
use linfa_ica::fast_ica::FastIca;
use linfa_linalg::eigh::{EigSort, Eigh};
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn, concatenate};
use rayon::prelude::*;

use super::{CanIcaParams, Decomposer, DecomposerFactory, Score, Subjects, Threshold};
use crate::image::Image;

/// `sqrt(8 ln 2)`, the FWHM of a unit Gaussian.
const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

/// Eigenvalues below this fraction of the largest one are treated as zero.
const RCOND: f64 = 1e-10;

/// Builds [`CanIcaEstimator`]s with fixed FastICA convergence settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastIcaFactory {
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for FastIcaFactory {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-4,
        }
    }
}

impl DecomposerFactory for FastIcaFactory {
    fn build(&self, params: &CanIcaParams) -> anyhow::Result<Box<dyn Decomposer>> {
        Ok(Box::new(CanIcaEstimator {
            params: params.clone(),
            max_iter: self.max_iter,
            tol: self.tol,
            fitted: None,
        }))
    }
}

/// The group maps found by [`CanIcaEstimator::fit`].
#[derive(Debug, Clone)]
struct Fitted {
    grid: Vec<usize>,
    /// Row-major indices into the spatial grid of the voxels in use.
    voxels: Vec<usize>,
    /// `(n_components, n_voxels)`
    maps: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct CanIcaEstimator {
    params: CanIcaParams,
    max_iter: usize,
    tol: f64,
    fitted: Option<Fitted>,
}

impl CanIcaEstimator {
    fn fitted(&self) -> anyhow::Result<&Fitted> {
        self.fitted
            .as_ref()
            .ok_or_else(|| anyhow!("The estimator has not been fitted"))
    }

    /// Masked, cleaned time series of one subject, `(n_volumes, n_voxels)`.
    fn subject_matrix(
        &self,
        image: &Image,
        grid: &[usize],
        voxels: &[usize],
        confounds: Option<&Array2<f64>>,
    ) -> anyhow::Result<Array2<f64>> {
        ensure!(
            image.spatial_shape() == grid,
            "Image grid {:?} differs from the fitted grid {:?}",
            image.spatial_shape(),
            grid
        );

        let mut data = image.data.mapv(f64::from);
        if let Some(fwhm) = self.params.smoothing_fwhm {
            smooth(&mut data, fwhm, &image.header.pixdim[1..4]);
        }

        let n_spatial: usize = grid.iter().product();
        let n_volumes = image.n_volumes();
        let flat = data.to_shape((n_spatial, n_volumes))?;

        let mut x = Array2::zeros((n_volumes, voxels.len()));
        for (column, &voxel) in voxels.iter().enumerate() {
            x.column_mut(column).assign(&flat.row(voxel));
        }

        clean(&mut x, confounds, self.params.standardize)?;
        Ok(x)
    }

    /// Least-squares loadings of `x` on the fitted maps, `(n_volumes, k)`.
    fn project(fitted: &Fitted, gram_inv: &Array2<f64>, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&fitted.maps.t()).dot(gram_inv)
    }
}

impl Decomposer for CanIcaEstimator {
    fn fit(&mut self, subjects: &Subjects<'_>) -> anyhow::Result<()> {
        let k = self.params.n_components();
        let (grid, voxels) = select_voxels(subjects)?;
        ensure!(
            voxels.len() > k,
            "{} voxels are too few for {k} components",
            voxels.len()
        );

        let this = &*self;
        let reduced = subjects
            .images
            .par_iter()
            .map(|image| -> anyhow::Result<Array2<f64>> {
                let x = this.subject_matrix(image, &grid, &voxels, subjects.confounds)?;
                let (singular, rows) = leading_components(&x, k)?;
                Ok(if this.params.do_cca {
                    rows
                } else {
                    rows * &singular.insert_axis(Axis(1))
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let views: Vec<_> = reduced.iter().map(Array2::view).collect();
        let stacked = concatenate(Axis(0), &views)?;
        let (_, group) = leading_components(&stacked, k)?;
        ensure!(
            group.nrows() == k,
            "The data supports only {} components, {k} were requested",
            group.nrows()
        );

        let samples = group.t().to_owned();
        let mut ica = FastIca::<f64>::params()
            .ncomponents(k)
            .max_iter(self.max_iter)
            .tol(self.tol);
        if let Some(seed) = self.params.random_state {
            ica = ica.random_state(seed as usize);
        }

        let model = ica
            .fit(&DatasetBase::from(samples.clone()))
            .map_err(|e| anyhow!("FastICA failed: {e}"))?;
        let sources: Array2<f64> = model.predict(&samples);
        let mut maps = sources.reversed_axes().as_standard_layout().into_owned();

        if let Threshold::Ratio(ratio) = self.params.threshold {
            apply_threshold(&mut maps, ratio);
        }
        for mut map in maps.rows_mut() {
            let max = map.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let min = map.fold(f64::INFINITY, |a, &b| a.min(b));
            if max < -min {
                map.mapv_inplace(|v| -v);
            }
        }

        tracing::debug!(
            voxels = voxels.len(),
            subjects = subjects.images.len(),
            components = k,
            "fitted canonical ICA"
        );

        self.fitted = Some(Fitted { grid, voxels, maps });
        Ok(())
    }

    /// Fraction of the cleaned signal variance the maps explain.
    fn score(&self, subjects: &Subjects<'_>) -> anyhow::Result<Score> {
        let fitted = self.fitted()?;
        let gram_inv = pinv_sym(&fitted.maps.dot(&fitted.maps.t()))?;

        let (residual, total) = subjects
            .images
            .par_iter()
            .map(|image| -> anyhow::Result<(f64, f64)> {
                let x = self.subject_matrix(image, &fitted.grid, &fitted.voxels, subjects.confounds)?;
                let rebuilt = Self::project(fitted, &gram_inv, &x).dot(&fitted.maps);
                let residual = (&x - &rebuilt).mapv(|v| v * v).sum();
                Ok((residual, x.mapv(|v| v * v).sum()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .fold((0.0, 0.0), |(r, t), (a, b)| (r + a, t + b));

        let explained = if total > 0.0 {
            1.0 - residual / total
        } else {
            0.0
        };
        Ok(Score::Scalar(explained))
    }

    fn transform(&self, subjects: &Subjects<'_>) -> anyhow::Result<Vec<Array2<f64>>> {
        let fitted = self.fitted()?;
        let gram_inv = pinv_sym(&fitted.maps.dot(&fitted.maps.t()))?;

        subjects
            .images
            .par_iter()
            .map(|image| -> anyhow::Result<Array2<f64>> {
                let x = self.subject_matrix(image, &fitted.grid, &fitted.voxels, subjects.confounds)?;
                Ok(Self::project(fitted, &gram_inv, &x))
            })
            .collect()
    }

    fn components(&self) -> anyhow::Result<ArrayD<f32>> {
        let fitted = self.fitted()?;
        let k = fitted.maps.nrows();
        let n_spatial: usize = fitted.grid.iter().product();

        let mut flat = Array2::<f32>::zeros((n_spatial, k));
        for (column, &voxel) in fitted.voxels.iter().enumerate() {
            for component in 0..k {
                flat[[voxel, component]] = fitted.maps[[component, column]] as f32;
            }
        }

        let mut shape = fitted.grid.clone();
        shape.push(k);
        Ok(flat.into_shape_with_order(IxDyn(&shape))?)
    }
}

/// The spatial grid and the voxels to decompose: the nonzero voxels of the
/// mask, or of any volume of the first subject when no mask is given.
fn select_voxels(subjects: &Subjects<'_>) -> anyhow::Result<(Vec<usize>, Vec<usize>)> {
    let first = subjects
        .images
        .first()
        .context("No subject images to decompose")?;
    let grid = first.spatial_shape().to_vec();

    let voxels: Vec<usize> = match subjects.mask {
        Some(mask) => mask
            .volume(0)?
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v != 0.0)
            .map(|(i, _)| i)
            .collect(),
        None => {
            let n_spatial: usize = grid.iter().product();
            let flat = first.data.to_shape((n_spatial, first.n_volumes()))?;
            flat.rows()
                .into_iter()
                .enumerate()
                .filter(|(_, row)| row.iter().any(|&v| v != 0.0))
                .map(|(i, _)| i)
                .collect()
        }
    };

    ensure!(!voxels.is_empty(), "No voxels left to decompose");
    Ok((grid, voxels))
}

/// Centers every column, regresses out the confounds and optionally scales
/// every column to unit variance.
fn clean(
    x: &mut Array2<f64>,
    confounds: Option<&Array2<f64>>,
    standardize: bool,
) -> anyhow::Result<()> {
    center_columns(x);

    if let Some(confounds) = confounds {
        let mut c = confounds.clone();
        center_columns(&mut c);
        let beta = pinv_sym(&c.t().dot(&c))?.dot(&c.t().dot(&*x));
        *x -= &c.dot(&beta);
    }

    if standardize {
        let n = x.nrows().max(1) as f64;
        for mut column in x.columns_mut() {
            let sd = (column.mapv(|v| v * v).sum() / n).sqrt();
            if sd > f64::EPSILON {
                column.mapv_inplace(|v| v / sd);
            }
        }
    }

    Ok(())
}

fn center_columns(x: &mut Array2<f64>) {
    if let Some(mean) = x.mean_axis(Axis(0)) {
        *x -= &mean;
    }
}

/// Singular values and leading right singular vectors (as rows) of a wide
/// matrix, through the eigendecomposition of its small Gram matrix.
fn leading_components(x: &Array2<f64>, k: usize) -> anyhow::Result<(Array1<f64>, Array2<f64>)> {
    let (values, vectors) = x.dot(&x.t()).eigh()?.sort_eig_desc();
    let top = values.iter().copied().fold(0.0, f64::max);

    let keep: Vec<usize> = (0..values.len())
        .filter(|&i| values[i] > top * RCOND && values[i] > 0.0)
        .take(k)
        .collect();

    let mut singular = Array1::zeros(keep.len());
    let mut rows = Array2::zeros((keep.len(), x.ncols()));
    for (row, &i) in keep.iter().enumerate() {
        let s = values[i].sqrt();
        singular[row] = s;
        rows.row_mut(row).assign(&(vectors.column(i).dot(x) / s));
    }

    Ok((singular, rows))
}

/// Pseudo-inverse of a symmetric positive semi-definite matrix.
fn pinv_sym(m: &Array2<f64>) -> anyhow::Result<Array2<f64>> {
    let (values, vectors) = m.eigh()?;
    let top = values.iter().fold(0.0_f64, |a, &b| a.max(b.abs()));
    let inverse = values.mapv(|l| if l.abs() > top * RCOND { 1.0 / l } else { 0.0 });
    Ok((&vectors * &inverse).dot(&vectors.t()))
}

/// Zeroes every entry below the `100 - 100 * ratio / k` percentile of the
/// absolute values, keeping about `ratio * n_voxels` entries in total.
fn apply_threshold(maps: &mut Array2<f64>, ratio: f64) {
    let percentile = 100.0 - 100.0 / maps.nrows() as f64 * ratio;
    if percentile <= 0.0 {
        return;
    }

    let mut magnitudes: Vec<f64> = maps.iter().map(|v| v.abs()).collect();
    magnitudes.sort_by(f64::total_cmp);
    let cutoff = score_at_percentile(&magnitudes, percentile);

    maps.mapv_inplace(|v| if v.abs() < cutoff { 0.0 } else { v });
}

/// Linear interpolation between the closest ranks of a sorted slice.
fn score_at_percentile(sorted: &[f64], percentile: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };

    let position = percentile.clamp(0.0, 100.0) / 100.0 * last as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    sorted[low] + (sorted[high] - sorted[low]) * (position - low as f64)
}

/// Separable Gaussian smoothing over the three spatial axes, weights
/// renormalized where the kernel leaves the volume.
fn smooth(data: &mut ArrayD<f64>, fwhm: f64, voxel_size: &[f32]) {
    for axis in 0..data.ndim().min(3) {
        let size = voxel_size
            .get(axis)
            .map(|&s| f64::from(s).abs())
            .filter(|&s| s > 0.0)
            .unwrap_or(1.0);
        let kernel = gaussian_kernel(fwhm / (FWHM_PER_SIGMA * size));
        if kernel.len() < 2 {
            continue;
        }

        let radius = (kernel.len() / 2) as isize;
        for mut lane in data.lanes_mut(Axis(axis)) {
            let input = lane.to_vec();
            for (i, out) in lane.iter_mut().enumerate() {
                let mut acc = 0.0;
                let mut norm = 0.0;
                for (j, w) in kernel.iter().enumerate() {
                    let source = i as isize + j as isize - radius;
                    if let Some(&v) = usize::try_from(source).ok().and_then(|s| input.get(s)) {
                        acc += w * v;
                        norm += w;
                    }
                }
                *out = if norm > 0.0 { acc / norm } else { 0.0 };
            }
        }
    }
}

/// Gaussian weights truncated at four standard deviations.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return vec![1.0];
    }

    let radius = (4.0 * sigma).ceil() as isize;
    (-radius..=radius)
        .map(|j| (-(j * j) as f64 / (2.0 * sigma * sigma)).exp())
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_threshold_keeps_top_entries() {
        let mut maps = array![[1.0, -8.0, 3.0, 0.5], [-2.0, 0.1, 6.0, 4.0]];
        // k = 2 and ratio 1 keep the upper half of the magnitudes
        apply_threshold(&mut maps, 1.0);
        assert_eq!(maps, array![[0.0, -8.0, 3.0, 0.0], [0.0, 0.0, 6.0, 4.0]]);

        let mut untouched = array![[1.0, 2.0], [3.0, 4.0]];
        apply_threshold(&mut untouched, 2.0);
        assert_eq!(untouched, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(score_at_percentile(&sorted, 50.0), 3.0);
        assert_eq!(score_at_percentile(&sorted, 75.0), 4.0);
        assert_eq!(score_at_percentile(&sorted, 62.5), 3.5);
        assert_eq!(score_at_percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_pseudo_inverse() {
        let m = array![[4.0, 0.0], [0.0, 0.0]];
        let inv = pinv_sym(&m).unwrap();
        assert!((inv[[0, 0]] - 0.25).abs() < 1e-12);
        assert!(inv[[1, 1]].abs() < 1e-12);
    }

    #[test]
    fn test_clean_removes_confound() {
        let drift = array![[0.0], [1.0], [2.0], [3.0]];
        let mut x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0], [7.0, 5.0]];
        clean(&mut x, Some(&drift), false).unwrap();
        assert!(x.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_smoothing_keeps_constant() {
        let mut data = ArrayD::from_elem(IxDyn(&[5, 5, 5]), 2.0);
        smooth(&mut data, 6.0, &[2.0, 2.0, 2.0]);
        assert!(data.iter().all(|v| (v - 2.0).abs() < 1e-12));

        let mut spike = ArrayD::zeros(IxDyn(&[9, 1, 1]));
        spike[[4, 0, 0]] = 1.0;
        smooth(&mut spike, 4.0, &[2.0, 2.0, 2.0]);
        assert!(spike[[4, 0, 0]] < 1.0);
        assert!(spike[[3, 0, 0]] > 0.0);
        assert!((spike[[3, 0, 0]] - spike[[5, 0, 0]]).abs() < 1e-12);
    }
}
