#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
pub mod decompose;
mod error;
pub mod files;
mod hash;
pub mod image;
pub mod interfaces;
pub mod motion;
pub mod rest;
pub mod rsn;
pub mod table;
pub mod utils;
pub mod workflow;

pub use crate::config::RunConfig;
pub use crate::decompose::{
    CanIca, CanIcaInputs, CanIcaInterface, CanIcaParams, Decomposer, DecompositionOutputs,
    FastIcaFactory, Threshold,
};
pub use crate::error::*;
pub use crate::files::{add_extension_if_needed, get_extension, remove_ext, rename};
pub use crate::image::{Image, to_image};
pub use crate::motion::{MotionSheet, motion_stats_sheet};
pub use crate::rest::{
    RestAttachment, attach_rest_preprocessing, attach_rest_preprocessing_to,
    build_rest_preprocessing_subgraph,
};
pub use crate::workflow::{
    Interface, Node, NodeContext, NodeId, Report, SlotSpec, Value, Values, Workflow,
    extend_list_setting, find_node, get_datasink, get_input_node,
};
