use std::any::Any;
use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::workflow::{Interface, NodeContext, SlotSpec, Value, Values};

/// Slots of [`DataSink`] that configure it rather than carry results.
const SETTINGS: [&str; 4] = [
    DataSink::BASE_DIRECTORY,
    DataSink::CONTAINER,
    DataSink::SUBSTITUTIONS,
    DataSink::REGEXP_SUBSTITUTIONS,
];

/// Copies results into a stable output tree.
///
/// Every input slot other than the settings is a destination. A slot named
/// `anat.tissues.@warped` stages its files into
/// `<base_directory>/<container>/anat/tissues/`; segments starting with `@`
/// only keep slot names distinct. The destination path of each file is then
/// rewritten by `substitutions` (plain string pairs) and after that by
/// `regexp_substitutions` (regex pairs, `$1`-style groups), in order.
#[derive(Debug, Clone, Default)]
pub struct DataSink;

impl DataSink {
    pub const BASE_DIRECTORY: &'static str = "base_directory";
    pub const CONTAINER: &'static str = "container";
    pub const SUBSTITUTIONS: &'static str = "substitutions";
    pub const REGEXP_SUBSTITUTIONS: &'static str = "regexp_substitutions";

    pub fn new() -> Self {
        Self
    }

    /// Directory a slot stages into, relative to the container.
    fn slot_dir(slot: &str) -> Utf8PathBuf {
        slot.split('.')
            .filter(|part| !part.is_empty() && !part.starts_with('@'))
            .collect()
    }

    fn rewrite(path: &str, plain: &[(String, String)], regexp: &[(Regex, String)]) -> String {
        let path = plain
            .iter()
            .fold(path.to_string(), |acc, (from, to)| acc.replace(from, to));

        regexp.iter().fold(path, |acc, (pattern, replacement)| {
            pattern.replace_all(&acc, replacement.as_str()).into_owned()
        })
    }
}

impl Interface for DataSink {
    fn kind(&self) -> &'static str {
        "datasink"
    }

    fn input_slots(&self) -> SlotSpec {
        SlotSpec::Open
    }

    fn output_slots(&self) -> SlotSpec {
        SlotSpec::fixed(["out_file"])
    }

    fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
        let mut root = match inputs.get(Self::BASE_DIRECTORY) {
            Some(Value::File(dir)) => dir.clone(),
            Some(Value::Text(dir)) => Utf8PathBuf::from(dir),
            Some(other) => {
                anyhow::bail!("'base_directory' must be a path, found {}", other.kind())
            }
            None => ctx.work_dir.clone(),
        };

        if let Some(container) = inputs.text_opt(Self::CONTAINER)? {
            root.push(container);
        }

        let plain = match inputs.get(Self::SUBSTITUTIONS) {
            Some(_) => inputs.pairs(Self::SUBSTITUTIONS)?.to_vec(),
            None => Vec::new(),
        };

        let regexp = match inputs.get(Self::REGEXP_SUBSTITUTIONS) {
            Some(_) => inputs
                .pairs(Self::REGEXP_SUBSTITUTIONS)?
                .iter()
                .map(|(pattern, replacement)| {
                    Regex::new(pattern)
                        .with_context(|| format!("Invalid substitution pattern '{pattern}'"))
                        .map(|re| (re, replacement.clone()))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let mut staged = Vec::new();

        for (slot, value) in inputs.iter() {
            if SETTINGS.contains(&slot) {
                continue;
            }

            let files = value.files();
            if files.is_empty() {
                tracing::debug!(node = %ctx.name, slot, "no files to stage");
                continue;
            }

            let dir = root.join(Self::slot_dir(slot));

            for file in files {
                let name = file
                    .file_name()
                    .with_context(|| format!("Cannot stage '{file}', it has no file name"))?;

                let target = Self::rewrite(dir.join(name).as_str(), &plain, &regexp);
                let target = Utf8PathBuf::from(target);
                stage(file, &target)?;
                staged.push(target);
            }
        }

        Ok(Values::new().with("out_file", staged))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn stage(source: &Utf8Path, target: &Utf8Path) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::copy(source, target)
        .with_context(|| format!("Couldn't copy '{source}' to '{target}'"))?;

    tracing::debug!("Staged {source} -> {target}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::tmp;

    #[test]
    fn test_slot_dir() {
        assert_eq!(DataSink::slot_dir("anat.tissues.@warped"), "anat/tissues");
        assert_eq!(DataSink::slot_dir("anat.@mni"), "anat");
        assert_eq!(DataSink::slot_dir("@root"), "");
    }

    #[test]
    fn test_rewrite_order() {
        let plain = vec![("sub-01".to_string(), "subject".to_string())];
        let regexp = vec![(
            Regex::new(r"/subject_trim\.nii(\.gz)?$").unwrap(),
            "/rest_trim.nii$1".to_string(),
        )];

        assert_eq!(
            DataSink::rewrite("out/rest/sub-01_trim.nii.gz", &plain, &regexp),
            "out/rest/rest_trim.nii.gz"
        );
    }

    #[test]
    fn test_stages_files() {
        let (_guard, dir) = tmp();
        let source = dir.join("work/sub01_trim.nii.gz");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"volume").unwrap();

        let inputs = Values::new()
            .with(DataSink::BASE_DIRECTORY, dir.join("out"))
            .with(DataSink::CONTAINER, "sub01")
            .with(
                DataSink::REGEXP_SUBSTITUTIONS,
                Value::Pairs(vec![(
                    r"/sub01_trim\.nii(\.gz)?$".into(),
                    "/rest_trim.nii$1".into(),
                )]),
            )
            .with("rest.@trim", source.clone())
            .with("note", "not a file");

        let ctx = NodeContext::new("datasink", dir.join("sink"));
        let outputs = DataSink::new().run(&ctx, &inputs).unwrap();

        let expected = dir.join("out/sub01/rest/rest_trim.nii.gz");
        assert_eq!(outputs.files("out_file").unwrap(), vec![expected.as_path()]);
        assert_eq!(fs::read(&expected).unwrap(), b"volume");
    }
}
