use serde::Serialize;

use crate::error::DecompositionError;

/// Number of components used when none is requested.
pub const DEFAULT_COMPONENTS: usize = 20;

/// Voxel thresholding applied to the component maps.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    #[default]
    Disabled,
    /// Keep `ratio * n_voxels` voxels across all maps.
    Ratio(f64),
}

/// Settings of a canonical ICA decomposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanIcaParams {
    pub n_components: Option<usize>,
    /// Run a canonical correlation analysis after the per-subject PCA.
    pub do_cca: bool,
    pub threshold: Threshold,
    /// Seed for the estimator; unseeded runs are not reproducible.
    pub random_state: Option<u64>,
    /// Full width at half maximum of the spatial smoothing, in millimetres.
    pub smoothing_fwhm: Option<f64>,
    /// Center each time series and scale it to unit variance.
    pub standardize: bool,
}

impl Default for CanIcaParams {
    fn default() -> Self {
        Self {
            n_components: None,
            do_cca: true,
            threshold: Threshold::Disabled,
            random_state: None,
            smoothing_fwhm: None,
            standardize: true,
        }
    }
}

impl CanIcaParams {
    pub fn n_components(&self) -> usize {
        self.n_components.unwrap_or(DEFAULT_COMPONENTS)
    }

    pub fn validate(&self) -> Result<(), DecompositionError> {
        if self.n_components == Some(0) {
            return Err(invalid("n_components", "must be a positive integer"));
        }

        if let Threshold::Ratio(ratio) = self.threshold
            && !(ratio.is_finite() && ratio > 0.0)
        {
            return Err(invalid(
                "threshold",
                format!("ratio must be a positive number, got {ratio}"),
            ));
        }

        if let Some(fwhm) = self.smoothing_fwhm
            && !(fwhm.is_finite() && fwhm > 0.0)
        {
            return Err(invalid(
                "smoothing_fwhm",
                format!("must be a positive number of millimetres, got {fwhm}"),
            ));
        }

        Ok(())
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> DecompositionError {
    DecompositionError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = CanIcaParams::default();
        assert_eq!(params.n_components(), 20);
        assert!(params.do_cca);
        assert!(params.standardize);
        assert_eq!(params.threshold, Threshold::Disabled);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero = CanIcaParams {
            n_components: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(DecompositionError::InvalidParameter {
                name: "n_components",
                ..
            })
        ));

        for ratio in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = CanIcaParams {
                threshold: Threshold::Ratio(ratio),
                ..Default::default()
            };
            assert!(params.validate().is_err(), "ratio {ratio} accepted");
        }

        let smoothing = CanIcaParams {
            smoothing_fwhm: Some(-6.0),
            ..Default::default()
        };
        assert!(smoothing.validate().is_err());

        let ratio = CanIcaParams {
            threshold: Threshold::Ratio(2.0),
            n_components: Some(5),
            ..Default::default()
        };
        assert!(ratio.validate().is_ok());
    }
}
