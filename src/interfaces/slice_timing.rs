use std::any::Any;
use std::fs;

use anyhow::Context;
use nifti::NiftiHeader;
use serde::Serialize;

use crate::image::Image;
use crate::workflow::{Interface, NodeContext, SlotSpec, Values};

/// Slice acquisition order, as coded by the NIfTI `slice_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceOrder {
    SequentialIncreasing,
    SequentialDecreasing,
    AlternatingIncreasing,
    AlternatingDecreasing,
    AlternatingIncreasing2,
    AlternatingDecreasing2,
}

impl SliceOrder {
    /// Unknown or unset codes fall back to sequential increasing.
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => SliceOrder::SequentialDecreasing,
            3 => SliceOrder::AlternatingIncreasing,
            4 => SliceOrder::AlternatingDecreasing,
            5 => SliceOrder::AlternatingIncreasing2,
            6 => SliceOrder::AlternatingDecreasing2,
            _ => SliceOrder::SequentialIncreasing,
        }
    }

    /// 1-based slice numbers in the order they were acquired.
    pub fn slices(self, n: usize) -> Vec<usize> {
        let odd = (1..=n).step_by(2);
        let even = (2..=n).step_by(2);
        let top = (1..=n).rev().step_by(2);
        let below = (1..n).rev().step_by(2);

        match self {
            SliceOrder::SequentialIncreasing => (1..=n).collect(),
            SliceOrder::SequentialDecreasing => (1..=n).rev().collect(),
            SliceOrder::AlternatingIncreasing => odd.chain(even).collect(),
            SliceOrder::AlternatingIncreasing2 => even.chain(odd).collect(),
            SliceOrder::AlternatingDecreasing => top.chain(below).collect(),
            SliceOrder::AlternatingDecreasing2 => below.chain(top).collect(),
        }
    }
}

/// Timing metadata for slice-timing correction, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingParams {
    pub n_slices: usize,
    pub time_repetition: f64,
    pub time_acquisition: f64,
    pub order: SliceOrder,
    pub slice_order: Vec<usize>,
    pub ref_slice: usize,
}

impl TimingParams {
    /// Derives the parameters from an image header.
    ///
    /// `time_repetition` overrides the repetition time stored in the header.
    pub fn from_header(
        header: &NiftiHeader,
        time_repetition: Option<f64>,
    ) -> anyhow::Result<Self> {
        // bits 4-5 of dim_info, 0 means unknown and is taken as z
        let slice_dim = match (header.dim_info >> 4) & 0b11 {
            0 => 3,
            dim => dim as usize,
        };

        let n_slices = header.dim[slice_dim] as usize;
        anyhow::ensure!(n_slices > 0, "Image declares no slices along axis {slice_dim}");

        let time_repetition = match time_repetition {
            Some(tr) => tr,
            None => f64::from(header.pixdim[4]) * time_unit_scale(header.xyzt_units),
        };
        anyhow::ensure!(
            time_repetition > 0.0,
            "Repetition time must be positive, found {time_repetition}"
        );

        let order = SliceOrder::from_code(header.slice_code);
        let slice_order = order.slices(n_slices);
        let ref_slice = slice_order[n_slices / 2];

        Ok(Self {
            n_slices,
            time_repetition,
            time_acquisition: time_repetition - time_repetition / n_slices as f64,
            order,
            slice_order,
            ref_slice,
        })
    }
}

/// Seconds per unit of the time code in bits 3-5 of `xyzt_units`.
fn time_unit_scale(xyzt_units: u8) -> f64 {
    match xyzt_units & 0x38 {
        16 => 1e-3,
        24 => 1e-6,
        _ => 1.0,
    }
}

/// Reads slice-timing parameters from the header of a 4-D image.
///
/// Writes them to `slice_timing_params.json` in the node working directory
/// and passes `in_file` through, so a correction step can be wired after it.
#[derive(Debug, Clone, Default)]
pub struct SliceTimingParams;

impl SliceTimingParams {
    pub const PARAMS_FILE: &'static str = "slice_timing_params.json";

    pub fn new() -> Self {
        Self
    }
}

impl Interface for SliceTimingParams {
    fn kind(&self) -> &'static str {
        "slice_timing_params"
    }

    fn input_slots(&self) -> SlotSpec {
        SlotSpec::fixed(["in_file", "time_repetition"])
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::fixed([
            "in_file",
            "n_slices",
            "time_repetition",
            "time_acquisition",
            "slice_order",
            "ref_slice",
            "params_file",
        ])
    }

    fn mandatory_inputs(&self) -> Vec<&'static str> {
        vec!["in_file"]
    }

    fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let in_file = inputs.file("in_file")?;
        let image = Image::open(in_file)?;
        anyhow::ensure!(
            image.data.ndim() == 4,
            "Slice timing needs a 4-D image, '{in_file}' has shape {:?}",
            image.shape()
        );

        let time_repetition = inputs.float_opt("time_repetition")?;
        let params = TimingParams::from_header(&image.header, time_repetition)
            .with_context(|| format!("Couldn't derive slice timing of '{in_file}'"))?;

        let params_file = ctx.work_dir().join(Self::PARAMS_FILE);
        fs::write(&params_file, serde_json::to_string_pretty(&params)?)?;

        tracing::debug!(
            node = %ctx.name,
            n_slices = params.n_slices,
            tr = params.time_repetition,
            "slice timing parameters"
        );

        let slice_order: Vec<i64> = params.slice_order.iter().map(|&s| s as i64).collect();

        Ok(Values::new()
            .with("in_file", in_file)
            .with("n_slices", params.n_slices)
            .with("time_repetition", params.time_repetition)
            .with("time_acquisition", params.time_acquisition)
            .with("slice_order", slice_order)
            .with("ref_slice", params.ref_slice)
            .with("params_file", params_file))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
