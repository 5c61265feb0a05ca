//! Multi-subject spatial decomposition as a pipeline step.
//!
//! The numerical routine sits behind the [`Decomposer`] trait, with
//! [`FastIcaFactory`] building the default `linfa-ica` based estimator.
//! [`CanIca`] loads and checks the subject images, drives a decomposer
//! through fit, score and transform, and writes the results as files:
//!
//! - `canica_resting_state.nii.gz`, one volume per component,
//! - `canica_score.txt`, the fit score,
//! - `canica_<i>_loading.txt`, the loadings of subject `i` (zero-based).
//!
//! Every input check runs before the decomposer is built, so a rejected
//! input set leaves no files behind.

mod estimator;
mod node;
mod params;

use std::fmt::Debug;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{Array1, Array2, ArrayD};

pub use self::estimator::{CanIcaEstimator, FastIcaFactory};
pub use self::node::CanIcaInterface;
pub use self::params::{CanIcaParams, DEFAULT_COMPONENTS, Threshold};
use crate::error::DecompositionError;
use crate::image::{Image, to_image};
use crate::table::{read_matrix, write_matrix, write_scalar, write_vector};
use crate::utils::as_overhead;

/// Label used as the prefix of every output file.
pub const ESTIMATOR_LABEL: &str = "canica";

/// The loaded input set handed to a [`Decomposer`].
#[derive(Debug, Clone, Copy)]
pub struct Subjects<'a> {
    /// One 4-D image per subject, all on the same voxel grid.
    pub images: &'a [Image],
    pub mask: Option<&'a Image>,
    /// Columns regressed out of every subject's time series.
    pub confounds: Option<&'a Array2<f64>>,
}

/// How well the fitted components explain the data.
#[derive(Debug, Clone, PartialEq)]
pub enum Score {
    Scalar(f64),
    /// One score per component.
    Vector(Array1<f64>),
    /// One row per subject, one column per component.
    Matrix(Array2<f64>),
}

impl Score {
    /// Writes the score as a fixed-point table.
    ///
    /// A scalar goes on a single line with no trailing newline.
    pub fn write(&self, path: impl AsRef<Utf8Path>) -> Result<(), DecompositionError> {
        match self {
            Score::Scalar(value) => write_scalar(path, *value)?,
            Score::Vector(values) => write_vector(path, values.view())?,
            Score::Matrix(values) => write_matrix(path, values.view())?,
        }
        Ok(())
    }
}

/// A fitted-on-demand multi-subject decomposition.
pub trait Decomposer: Send {
    fn fit(&mut self, subjects: &Subjects<'_>) -> anyhow::Result<()>;

    fn score(&self, subjects: &Subjects<'_>) -> anyhow::Result<Score>;

    /// Per-subject loadings, each `(n_volumes, n_components)`.
    fn transform(&self, subjects: &Subjects<'_>) -> anyhow::Result<Vec<Array2<f64>>>;

    /// Component maps back in voxel space, `(x, y, z, n_components)`.
    fn components(&self) -> anyhow::Result<ArrayD<f32>>;
}

/// Builds a fresh [`Decomposer`] for every run.
pub trait DecomposerFactory: Send + Sync {
    fn build(&self, params: &CanIcaParams) -> anyhow::Result<Box<dyn Decomposer>>;
}

impl<F> DecomposerFactory for F
where
    F: Fn(&CanIcaParams) -> anyhow::Result<Box<dyn Decomposer>> + Send + Sync,
{
    fn build(&self, params: &CanIcaParams) -> anyhow::Result<Box<dyn Decomposer>> {
        self(params)
    }
}

/// Paths of the subject images and their optional companions.
#[derive(Debug, Clone, Default)]
pub struct CanIcaInputs {
    pub in_files: Vec<Utf8PathBuf>,
    pub mask: Option<Utf8PathBuf>,
    /// Delimited table, one row per volume.
    pub confounds: Option<Utf8PathBuf>,
}

impl CanIcaInputs {
    pub fn new<I, P>(in_files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            in_files: in_files.into_iter().map(Into::into).collect(),
            mask: None,
            confounds: None,
        }
    }

    pub fn mask(mut self, mask: impl Into<Utf8PathBuf>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn confounds(mut self, confounds: impl Into<Utf8PathBuf>) -> Self {
        self.confounds = Some(confounds.into());
        self
    }
}

/// Files written by a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionOutputs {
    pub components: Utf8PathBuf,
    pub score: Utf8PathBuf,
    pub loadings: Vec<Utf8PathBuf>,
}

impl DecompositionOutputs {
    fn in_dir(dir: &Utf8Path, subjects: usize) -> Self {
        Self {
            components: dir.join(format!("{ESTIMATOR_LABEL}_resting_state.nii.gz")),
            score: dir.join(format!("{ESTIMATOR_LABEL}_score.txt")),
            loadings: (0..subjects)
                .map(|i| dir.join(format!("{ESTIMATOR_LABEL}_{i}_loading.txt")))
                .collect(),
        }
    }
}

/// Canonical ICA over a group of subjects.
#[derive(Clone)]
pub struct CanIca {
    params: CanIcaParams,
    factory: Arc<dyn DecomposerFactory>,
}

impl Debug for CanIca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanIca")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Default for CanIca {
    fn default() -> Self {
        Self::new(FastIcaFactory::default())
    }
}

impl CanIca {
    pub fn new(factory: impl DecomposerFactory + 'static) -> Self {
        Self {
            params: CanIcaParams::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_params(mut self, params: CanIcaParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &CanIcaParams {
        &self.params
    }

    /// Runs the decomposition and writes its outputs into `dir`.
    pub fn run_in(
        &self,
        dir: impl AsRef<Utf8Path>,
        inputs: &CanIcaInputs,
    ) -> Result<DecompositionOutputs, DecompositionError> {
        let dir = dir.as_ref();
        let start = Instant::now();

        self.params.validate()?;
        if inputs.in_files.is_empty() {
            return Err(DecompositionError::NoInput);
        }

        let images = inputs
            .in_files
            .iter()
            .map(Image::open)
            .collect::<Result<Vec<_>, _>>()?;
        check_grid(&images)?;

        let mask = inputs.mask.as_ref().map(Image::open).transpose()?;
        if let Some(mask) = &mask
            && !mask.same_grid(&images[0])
        {
            return Err(DecompositionError::Mask {
                expected: images[0].spatial_shape().to_vec(),
                found: mask.spatial_shape().to_vec(),
            });
        }

        let confounds = inputs.confounds.as_ref().map(read_matrix).transpose()?;
        if let Some(confounds) = &confounds {
            check_confounds(confounds, &images)?;
        }

        let subjects = Subjects {
            images: &images,
            mask: mask.as_ref(),
            confounds: confounds.as_ref(),
        };

        tracing::info!(
            subjects = images.len(),
            n_components = self.params.n_components(),
            "Running {ESTIMATOR_LABEL}"
        );

        let estimator = |e| DecompositionError::Estimator(e);
        let mut decomposer = self.factory.build(&self.params).map_err(estimator)?;
        decomposer.fit(&subjects).map_err(estimator)?;
        let score = decomposer.score(&subjects).map_err(estimator)?;
        let loadings = decomposer.transform(&subjects).map_err(estimator)?;
        let components = decomposer.components().map_err(estimator)?;

        if loadings.len() != images.len() {
            return Err(estimator(anyhow::anyhow!(
                "Expected loadings for {} subjects, got {}",
                images.len(),
                loadings.len()
            )));
        }

        fs::create_dir_all(dir)?;
        let outputs = DecompositionOutputs::in_dir(dir, images.len());

        to_image(components, &images[0]).save(&outputs.components)?;
        score.write(&outputs.score)?;
        for (path, loading) in outputs.loadings.iter().zip(&loadings) {
            write_matrix(path, loading.view())?;
        }

        tracing::info!("Finished {ESTIMATOR_LABEL} {}", as_overhead(start));
        Ok(outputs)
    }
}

/// Every image must share the voxel grid of the first one. Run lengths may
/// differ between subjects.
fn check_grid(images: &[Image]) -> Result<(), DecompositionError> {
    let Some((first, rest)) = images.split_first() else {
        return Err(DecompositionError::NoInput);
    };

    for (offset, image) in rest.iter().enumerate() {
        let index = offset + 1;
        if image.spatial_shape() != first.spatial_shape() {
            return Err(DecompositionError::Dimension {
                index,
                expected: first.spatial_shape().to_vec(),
                found: image.spatial_shape().to_vec(),
            });
        }
        if image.affine() != first.affine() {
            return Err(DecompositionError::Affine { index });
        }
    }

    Ok(())
}

fn check_confounds(confounds: &Array2<f64>, images: &[Image]) -> Result<(), DecompositionError> {
    for (index, image) in images.iter().enumerate() {
        if confounds.nrows() != image.n_volumes() {
            return Err(DecompositionError::Confounds {
                index,
                rows: confounds.nrows(),
                volumes: image.n_volumes(),
            });
        }
    }
    Ok(())
}
