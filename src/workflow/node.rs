use std::any::Any;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Span;

use crate::error::GraphError;
use crate::workflow::{Value, Values};

/// Slot names an interface accepts on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSpec {
    Fixed(Vec<Cow<'static, str>>),
    /// Any name is accepted, e.g. the inputs of a results sink.
    Open,
}

impl SlotSpec {
    pub fn fixed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        SlotSpec::Fixed(names.into_iter().map(Into::into).collect())
    }

    pub fn accepts(&self, slot: &str) -> bool {
        match self {
            SlotSpec::Fixed(names) => names.iter().any(|name| name == slot),
            SlotSpec::Open => true,
        }
    }
}

/// Everything an interface can see about the node it runs as.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Full node name, including the prefixes of embedding workflows.
    pub name: String,
    /// Scratch directory owned by this node, created before it runs.
    pub work_dir: Utf8PathBuf,
    /// Tracing span for attaching progress to this node.
    pub span: Span,
}

impl NodeContext {
    pub fn new(name: impl Into<String>, work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            span: Span::none(),
        }
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }
}

/// A processing step that can be placed in a [`Workflow`](crate::Workflow).
///
/// Implementors declare their slots up front so the graph can reject bad
/// connections while it is assembled, long before anything runs.
pub trait Interface: Send + Sync + Debug {
    /// Short type name shown in logs and diagrams.
    fn kind(&self) -> &'static str;

    fn input_slots(&self) -> SlotSpec;

    fn output_slots(&self) -> SlotSpec;

    /// Inputs that must hold a value before [`Interface::run`] is called.
    fn mandatory_inputs(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Settings held by the interface itself rather than passed as inputs.
    ///
    /// They are part of the cache key, so two differently configured
    /// interfaces never share a stored result.
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values>;

    fn as_any(&self) -> &dyn Any;
}

/// A named instance of an interface with its preset inputs.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) interface: Arc<dyn Interface>,
    pub(crate) inputs: Values,
}

impl Node {
    pub fn new(name: impl Into<String>, interface: impl Interface + 'static) -> Self {
        Self {
            name: name.into(),
            interface: Arc::new(interface),
            inputs: Values::new(),
        }
    }

    /// Presets an input without checking the slot name.
    pub fn with_input(mut self, slot: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.set(slot, value);
        self
    }

    /// Presets an input after checking that the interface declares it.
    pub fn set_input(&mut self, slot: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        if !self.interface.input_slots().accepts(slot) {
            return Err(GraphError::UnknownSlot {
                node: self.name.clone(),
                slot: slot.to_string(),
                direction: "input",
            });
        }

        self.inputs.set(slot, value);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.interface.kind()
    }

    pub fn interface(&self) -> &dyn Interface {
        self.interface.as_ref()
    }

    pub fn input(&self, slot: &str) -> Option<&Value> {
        self.inputs.get(slot)
    }

    pub fn inputs(&self) -> &Values {
        &self.inputs
    }

    /// Downcasts the interface to a concrete type.
    pub fn interface_as<T: Interface + 'static>(&self) -> Option<&T> {
        self.interface.as_any().downcast_ref::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::IdentityInterface;

    #[test]
    fn test_slot_spec() {
        let spec = SlotSpec::fixed(["in_file", "begin_index"]);
        assert!(spec.accepts("in_file"));
        assert!(!spec.accepts("out_file"));
        assert!(SlotSpec::Open.accepts("anything.@goes"));
    }

    #[test]
    fn test_set_input_checks_slot() {
        let mut node = Node::new("rest_input", IdentityInterface::new(["rest"]));
        node.set_input("rest", Utf8PathBuf::from("rest.nii")).unwrap();
        assert_eq!(node.input("rest").and_then(Value::as_file), Some(Utf8Path::new("rest.nii")));

        let err = node.set_input("anat", 1i64).unwrap_err();
        assert!(matches!(err, GraphError::UnknownSlot { direction: "input", .. }));
    }

    #[test]
    fn test_downcast() {
        let node = Node::new("rest_input", IdentityInterface::new(["rest"]));
        assert!(node.interface_as::<IdentityInterface>().is_some());
        assert_eq!(node.kind(), "identity");
    }
}
