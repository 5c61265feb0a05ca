use std::any::Any;
use std::borrow::Cow;

use crate::workflow::{Interface, NodeContext, SlotSpec, Values};

/// Passes a fixed set of fields through unchanged.
///
/// Used as the input and output placeholders of subgraphs.
#[derive(Debug, Clone)]
pub struct IdentityInterface {
    fields: Vec<Cow<'static, str>>,
    mandatory: bool,
}

impl IdentityInterface {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            mandatory: false,
        }
    }

    /// Require every field to be set before the node runs.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.as_ref())
    }
}

impl Interface for IdentityInterface {
    fn kind(&self) -> &'static str {
        "identity"
    }

    fn input_slots(&self) -> SlotSpec {
        SlotSpec::Fixed(self.fields.clone())
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::Fixed(self.fields.clone())
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({
            "fields": self.fields().collect::<Vec<_>>(),
            "mandatory": self.mandatory,
        })
    }

    fn mandatory_inputs(&self) -> Vec<&'static str> {
        if !self.mandatory {
            return Vec::new();
        }

        // only static names can be reported, owned ones are checked in `run`
        self.fields
            .iter()
            .filter_map(|f| match f {
                Cow::Borrowed(name) => Some(*name),
                Cow::Owned(_) => None,
            })
            .collect()
    }

    fn run(&self, _: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let mut outputs = Values::new();

        for field in self.fields() {
            match inputs.get(field) {
                Some(value) => outputs.set(field, value.clone()),
                None if self.mandatory => anyhow::bail!("Mandatory field '{field}' is not set"),
                None => {}
            }
        }

        Ok(outputs)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_through() {
        let identity = IdentityInterface::new(["rest", "anat"]);
        let ctx = NodeContext::new("rest_input", "unused");
        let outputs = identity
            .run(&ctx, &Values::new().with("rest", "a.nii").with("other", 1i64))
            .unwrap();

        assert_eq!(outputs, Values::new().with("rest", "a.nii"));
    }

    #[test]
    fn test_mandatory() {
        let identity = IdentityInterface::new(["rest"]).mandatory();
        assert_eq!(identity.mandatory_inputs(), vec!["rest"]);

        let owned = IdentityInterface::new([String::from("rest")]).mandatory();
        let ctx = NodeContext::new("rest_input", "unused");
        assert!(owned.run(&ctx, &Values::new()).is_err());
    }
}
