use std::any::Any;

use anyhow::Context;
use camino::Utf8Path;

use super::{CanIca, CanIcaInputs, CanIcaParams, DecomposerFactory, Threshold};
use crate::workflow::{Interface, NodeContext, SlotSpec, Value, Values};

/// [`CanIca`] as a workflow node.
///
/// The parameters set on the wrapped [`CanIca`] are defaults; node inputs of
/// the same name override them for a single run. Outputs are written into the
/// node working directory. The default instance runs [`FastIcaFactory`].
///
/// [`FastIcaFactory`]: super::FastIcaFactory
#[derive(Debug, Clone, Default)]
pub struct CanIcaInterface {
    canica: CanIca,
}

impl CanIcaInterface {
    pub fn new(factory: impl DecomposerFactory + 'static) -> Self {
        Self {
            canica: CanIca::new(factory),
        }
    }

    pub fn with_params(mut self, params: CanIcaParams) -> Self {
        self.canica = self.canica.with_params(params);
        self
    }

    fn params(&self, inputs: &Values) -> anyhow::Result<CanIcaParams> {
        let mut params = self.canica.params().clone();

        if let Some(n) = inputs.int_opt("n_components")? {
            params.n_components =
                Some(usize::try_from(n).context("'n_components' must be a positive integer")?);
        }
        if let Some(do_cca) = inputs.bool_opt("do_cca")? {
            params.do_cca = do_cca;
        }
        if let Some(threshold) = inputs.get("threshold") {
            params.threshold = match threshold {
                Value::Bool(false) => Threshold::Disabled,
                Value::Float(ratio) => Threshold::Ratio(*ratio),
                Value::Int(ratio) => Threshold::Ratio(*ratio as f64),
                other => anyhow::bail!(
                    "'threshold' must be false or a ratio, found {}",
                    other.kind()
                ),
            };
        }
        if let Some(seed) = inputs.int_opt("random_state")? {
            params.random_state =
                Some(u64::try_from(seed).context("'random_state' must not be negative")?);
        }
        if let Some(fwhm) = inputs.float_opt("smoothing_fwhm")? {
            params.smoothing_fwhm = Some(fwhm);
        }
        if let Some(standardize) = inputs.bool_opt("standardize")? {
            params.standardize = standardize;
        }

        Ok(params)
    }
}

impl Interface for CanIcaInterface {
    fn kind(&self) -> &'static str {
        "canica"
    }

    fn input_slots(&self) -> SlotSpec {
        SlotSpec::fixed([
            "in_files",
            "mask",
            "confounds",
            "n_components",
            "do_cca",
            "threshold",
            "random_state",
            "smoothing_fwhm",
            "standardize",
        ])
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::fixed(["components", "score", "loadings"])
    }

    fn mandatory_inputs(&self) -> Vec<&'static str> {
        vec!["in_files"]
    }

    // the factory is opaque, only the preset parameters are covered
    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(self.canica.params()).unwrap_or_default()
    }

    fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let params = self.params(inputs)?;

        let in_files = inputs.files("in_files")?;
        let mut set = CanIcaInputs::new(in_files.into_iter().map(Utf8Path::to_path_buf));
        set.mask = inputs.file_opt("mask")?.map(Utf8Path::to_path_buf);
        set.confounds = inputs.file_opt("confounds")?.map(Utf8Path::to_path_buf);

        let outputs = self
            .canica
            .clone()
            .with_params(params)
            .run_in(ctx.work_dir(), &set)?;

        Ok(Values::new()
            .with("components", outputs.components)
            .with("score", outputs.score)
            .with("loadings", outputs.loadings))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::Decomposer;

    fn unused(_: &CanIcaParams) -> anyhow::Result<Box<dyn Decomposer>> {
        anyhow::bail!("not built in these tests")
    }

    #[test]
    fn test_inputs_override_params() {
        let node = CanIcaInterface::new(unused).with_params(CanIcaParams {
            n_components: Some(10),
            ..Default::default()
        });

        let inputs = Values::new()
            .with("n_components", 5i64)
            .with("threshold", 2.0)
            .with("random_state", 42i64)
            .with("do_cca", false);

        let params = node.params(&inputs).unwrap();
        assert_eq!(params.n_components, Some(5));
        assert_eq!(params.threshold, Threshold::Ratio(2.0));
        assert_eq!(params.random_state, Some(42));
        assert!(!params.do_cca);
        assert!(params.standardize);

        let disabled = node.params(&Values::new().with("threshold", false)).unwrap();
        assert_eq!(disabled.threshold, Threshold::Disabled);
        assert_eq!(disabled.n_components, Some(10));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let node = CanIcaInterface::new(unused);
        assert!(node.params(&Values::new().with("threshold", true)).is_err());
        assert!(node.params(&Values::new().with("random_state", -1i64)).is_err());
        assert!(node.params(&Values::new().with("n_components", -3i64)).is_err());
    }
}
