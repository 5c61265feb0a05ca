use std::any::Any;

use anyhow::Context;

use crate::files::fname_presuffix;
use crate::image::Image;
use crate::workflow::{Interface, NodeContext, SlotSpec, Values};

/// Drops leading and trailing volumes of a 4-D image.
///
/// `begin_index` and `end_index` can be preset on the interface and are
/// overridden by node inputs of the same name. An `end_index` of 0 or none
/// keeps every volume up to the last one. The result is written as
/// `<name>_trim<ext>` in the node working directory.
#[derive(Debug, Clone, Default)]
pub struct Trim {
    pub begin_index: usize,
    pub end_index: Option<usize>,
}

impl Trim {
    pub fn new(begin_index: usize) -> Self {
        Self {
            begin_index,
            end_index: None,
        }
    }
}

impl Interface for Trim {
    fn kind(&self) -> &'static str {
        "trim"
    }

    fn input_slots(&self) -> SlotSpec {
        SlotSpec::fixed(["in_file", "begin_index", "end_index", "suffix"])
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::fixed(["out_file"])
    }

    fn mandatory_inputs(&self) -> Vec<&'static str> {
        vec!["in_file"]
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({
            "begin_index": self.begin_index,
            "end_index": self.end_index,
        })
    }

    fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let in_file = inputs.file("in_file")?;

        let begin = match inputs.int_opt("begin_index")? {
            Some(index) => usize::try_from(index).context("'begin_index' must not be negative")?,
            None => self.begin_index,
        };

        let end = match inputs.int_opt("end_index")? {
            Some(index) => {
                Some(usize::try_from(index).context("'end_index' must not be negative")?)
            }
            None => self.end_index,
        };

        let image = Image::open(in_file)?;
        let end = match end {
            Some(0) | None => image.n_volumes(),
            Some(end) => end,
        };

        tracing::debug!(node = %ctx.name, begin, end, "trimming {in_file}");
        let trimmed = image.volumes(begin, end)?;

        let suffix = inputs.text_opt("suffix")?.unwrap_or("_trim");
        let out_file = fname_presuffix(in_file, "", suffix, Some(ctx.work_dir()))?;
        trimmed.save(&out_file)?;

        Ok(Values::new().with("out_file", out_file))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
