use std::any::Any;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use anyhow::Context;
use camino::Utf8PathBuf;
use glob::{Pattern, glob};
use regex::Regex;

use crate::workflow::{Interface, NodeContext, SlotSpec, Value, Values};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("Error compiling placeholder pattern"));

/// Selects input files by formatting glob templates with the node inputs.
///
/// A template such as `{subject_id}/rest.nii.gz` declares an input slot
/// `subject_id` and an output slot named after its field.
#[derive(Debug, Clone)]
pub struct SelectFiles {
    templates: BTreeMap<String, String>,
    base_directory: Option<Utf8PathBuf>,
    raise_on_empty: bool,
}

impl SelectFiles {
    pub fn new<I, K, V>(templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            templates: templates
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            base_directory: None,
            raise_on_empty: true,
        }
    }

    pub fn base_directory(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }

    /// Fail when a template matches no file, on by default.
    pub fn raise_on_empty(mut self, raise: bool) -> Self {
        self.raise_on_empty = raise;
        self
    }

    /// The raw template for `field`.
    pub fn template(&self, field: &str) -> Option<&str> {
        self.templates.get(field).map(String::as_str)
    }

    fn placeholders(&self) -> BTreeSet<String> {
        self.templates
            .values()
            .flat_map(|t| PLACEHOLDER.captures_iter(t))
            .map(|c| c[1].to_string())
            .collect()
    }

    fn format(template: &str, inputs: &Values) -> anyhow::Result<String> {
        let mut missing = None;

        let formatted = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match inputs.get(key) {
                Some(Value::Text(text)) => Pattern::escape(text),
                Some(Value::Int(int)) => int.to_string(),
                Some(Value::File(path)) => Pattern::escape(path.as_str()),
                _ => {
                    missing = Some(key.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(key) => {
                anyhow::bail!("No usable value for placeholder '{{{key}}}' in '{template}'")
            }
            None => Ok(formatted.into_owned()),
        }
    }
}

impl Interface for SelectFiles {
    fn kind(&self) -> &'static str {
        "select_files"
    }

    fn input_slots(&self) -> SlotSpec {
        let mut slots: Vec<Cow<'static, str>> =
            self.placeholders().into_iter().map(Into::into).collect();
        slots.push("base_directory".into());
        SlotSpec::Fixed(slots)
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::fixed(self.templates.keys().cloned())
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({
            "templates": self.templates,
            "base_directory": self.base_directory,
            "raise_on_empty": self.raise_on_empty,
        })
    }

    fn run(&self, _: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let base = match inputs.file_opt("base_directory")? {
            Some(dir) => Some(dir.to_path_buf()),
            None => self.base_directory.clone(),
        };

        let mut outputs = Values::new();

        for (field, template) in &self.templates {
            let mut pattern = Self::format(template, inputs)?;
            if let Some(base) = &base {
                pattern = format!("{}/{}", Pattern::escape(base.as_str()), pattern);
            }

            let mut files = Vec::new();
            for path in glob(&pattern).with_context(|| format!("Invalid pattern '{pattern}'"))? {
                files.push(Utf8PathBuf::try_from(path?)?);
            }
            files.sort();

            match files.len() {
                0 if self.raise_on_empty => {
                    anyhow::bail!("No file matched '{pattern}' for field '{field}'")
                }
                0 => tracing::warn!("No file matched '{pattern}' for field '{field}'"),
                1 => outputs.set(field.as_str(), files.remove(0)),
                _ => outputs.set(field.as_str(), files),
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
    use std::fs;

    use super::*;
    use crate::image::testing::tmp;

    #[test]
    fn test_slots_from_templates() {
        let select = SelectFiles::new([
            ("rest", "{subject_id}/{session}/rest.nii.gz"),
            ("anat", "{subject_id}/anat.nii.gz"),
        ]);

        assert!(select.input_slots().accepts("subject_id"));
        assert!(select.input_slots().accepts("session"));
        assert!(select.input_slots().accepts("base_directory"));
        assert!(!select.input_slots().accepts("rest"));
        assert!(select.output_slots().accepts("rest"));
    }

    #[test]
    fn test_selects_files() {
        let (_guard, dir) = tmp();
        fs::create_dir_all(dir.join("sub-01")).unwrap();
        fs::write(dir.join("sub-01/rest.nii.gz"), b"").unwrap();
        fs::write(dir.join("sub-01/run1.txt"), b"").unwrap();
        fs::write(dir.join("sub-01/run2.txt"), b"").unwrap();

        let select = SelectFiles::new([
            ("rest", "{subject_id}/rest.nii.gz"),
            ("runs", "{subject_id}/run*.txt"),
        ])
        .base_directory(dir.clone());
        let ctx = NodeContext::new("input_files", dir.as_str());
        let outputs = select
            .run(&ctx, &Values::new().with("subject_id", "sub-01"))
            .unwrap();

        assert_eq!(outputs.file("rest").unwrap(), dir.join("sub-01/rest.nii.gz"));
        assert_eq!(
            outputs.files("runs").unwrap(),
            vec![dir.join("sub-01/run1.txt"), dir.join("sub-01/run2.txt")]
        );
    }

    #[test]
    fn test_empty_selection() {
        let (_guard, dir) = tmp();
        let ctx = NodeContext::new("input_files", dir.as_str());
        let inputs = Values::new().with("subject_id", "nobody");

        let strict =
            SelectFiles::new([("rest", "{subject_id}/rest.nii.gz")]).base_directory(dir.clone());
        assert!(strict.run(&ctx, &inputs).is_err());

        let lenient = strict.raise_on_empty(false);
        assert!(lenient.run(&ctx, &inputs).unwrap().is_empty());

        let unformatted = SelectFiles::new([("rest", "{subject_id}/rest.nii.gz")]);
        assert!(unformatted.run(&ctx, &Values::new()).is_err());
    }
}
