//! Helpers for file names and extensions.
//!
//! Neuroimaging files routinely carry compound extensions such as `.nii.gz`.
//! These helpers treat a registered compound extension as one atomic suffix,
//! so stripping `x.nii.gz` yields `x` and never `x.nii`.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LookupError;

/// Table of compound extensions, keyed by the last suffix and listing the
/// suffixes allowed to precede it.
///
/// The default table only knows `.nii` + `.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundExtensions(BTreeMap<String, Vec<String>>);

impl CompoundExtensions {
    /// An empty table, every extension is a single suffix.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Allow `previous` to combine with `last`, e.g. `(".gz", ".nii")`.
    pub fn allow(mut self, last: impl Into<String>, previous: impl Into<String>) -> Self {
        self.0.entry(last.into()).or_default().push(previous.into());
        self
    }

    fn combines(&self, last: &str, previous: &str) -> bool {
        self.0
            .get(last)
            .is_some_and(|allowed| allowed.iter().any(|p| p == previous))
    }
}

impl Default for CompoundExtensions {
    fn default() -> Self {
        Self::empty().allow(".gz", ".nii")
    }
}

/// Split the last extension off `path`, ignoring leading dots of the file name.
fn split_ext(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    let name = &path[name_start..];
    let leading = name.len() - name.trim_start_matches('.').len();

    match name[leading..].rfind('.') {
        Some(i) => path.split_at(name_start + leading + i),
        None => (path, ""),
    }
}

/// Returns the extension of `path` using the default compound table.
///
/// ```
/// use neuropipe::files::get_extension;
///
/// assert_eq!(get_extension("sub-01/rest.nii.gz"), ".nii.gz");
/// assert_eq!(get_extension("motion.txt"), ".txt");
/// assert_eq!(get_extension("README"), "");
/// ```
pub fn get_extension(path: impl AsRef<Utf8Path>) -> String {
    get_extension_with(path, &CompoundExtensions::default())
}

/// Returns the longest extension of `path` allowed by `allowed`.
pub fn get_extension_with(path: impl AsRef<Utf8Path>, allowed: &CompoundExtensions) -> String {
    let (rest, ext) = split_ext(path.as_ref().as_str());
    let (_, previous) = split_ext(rest);

    if !previous.is_empty() && allowed.combines(ext, previous) {
        format!("{previous}{ext}")
    } else {
        ext.to_string()
    }
}

/// Removes the (possibly compound) extension of `path`.
pub fn remove_ext(path: impl AsRef<Utf8Path>) -> Result<String, LookupError> {
    let path = path.as_ref().as_str();
    let ext = get_extension(path);

    if ext.is_empty() {
        return Ok(path.to_string());
    }

    path.rfind(&ext)
        .map(|i| path[..i].to_string())
        .ok_or_else(|| LookupError::Substring {
            needle: ext,
            haystack: path.to_string(),
        })
}

/// Appends `ext` unless `path` already ends with it.
pub fn add_extension_if_needed(path: impl AsRef<Utf8Path>, ext: &str) -> String {
    let path = path.as_ref().as_str();

    if path.ends_with(ext) {
        path.to_string()
    } else {
        format!("{path}{ext}")
    }
}

/// Result of [`rename`]: a single path when a single path went in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renamed {
    One(Utf8PathBuf),
    Many(Vec<Utf8PathBuf>),
}

impl Renamed {
    pub fn into_vec(self) -> Vec<Utf8PathBuf> {
        match self {
            Renamed::One(path) => vec![path],
            Renamed::Many(paths) => paths,
        }
    }
}

/// Appends `suffix` (or `_000`, `_001`, ... when `None`) to each file name,
/// keeping the directory and the extension.
pub fn rename<I, P>(paths: I, suffix: Option<&str>) -> Result<Renamed, LookupError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Utf8Path>,
{
    let mut renamed = paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let suffix = match suffix {
                Some(suffix) => suffix.to_string(),
                None => format!("_{i:03}"),
            };
            fname_presuffix(path, "", &suffix, None)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if renamed.len() == 1 {
        Ok(Renamed::One(renamed.remove(0)))
    } else {
        Ok(Renamed::Many(renamed))
    }
}

/// Builds `<dir>/<prefix><stem><suffix><ext>` from `path`.
///
/// The directory of `path` is kept unless `new_dir` is given.
pub fn fname_presuffix(
    path: impl AsRef<Utf8Path>,
    prefix: &str,
    suffix: &str,
    new_dir: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, LookupError> {
    let path = path.as_ref();
    let name = path.file_name().unwrap_or_default();
    let stem = remove_ext(name)?;
    let ext = get_extension(name);

    let dir = match new_dir {
        Some(dir) => dir,
        None => path.parent().unwrap_or(Utf8Path::new("")),
    };

    Ok(dir.join(format!("{prefix}{stem}{suffix}{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_extension() {
        assert_eq!(get_extension("x.nii.gz"), ".nii.gz");
        assert_eq!(remove_ext("x.nii.gz").unwrap(), "x");
        assert_eq!(get_extension("data/sub-01/anat.nii.gz"), ".nii.gz");
        assert_eq!(remove_ext("data/sub-01/anat.nii.gz").unwrap(), "data/sub-01/anat");
    }

    #[test]
    fn test_plain_extension() {
        assert_eq!(get_extension("x.txt"), ".txt");
        assert_eq!(get_extension("archive.tar.gz"), ".gz");
        assert_eq!(get_extension("x.nii"), ".nii");
    }

    #[test]
    fn test_no_extension() {
        assert_eq!(get_extension("x"), "");
        assert_eq!(get_extension("dir.d/x"), "");
        assert_eq!(get_extension(".bashrc"), "");
        assert_eq!(remove_ext("dir.d/x").unwrap(), "dir.d/x");
    }

    #[test]
    fn test_custom_table() {
        let table = CompoundExtensions::default().allow(".gz", ".tar");
        assert_eq!(get_extension_with("a.tar.gz", &table), ".tar.gz");
        assert_eq!(get_extension_with("a.nii.gz", &table), ".nii.gz");
        assert_eq!(
            get_extension_with("a.nii.gz", &CompoundExtensions::empty()),
            ".gz"
        );
    }

    #[test]
    fn test_strip_and_reappend() {
        for path in ["x.txt", "a/b.nii.gz", "a/b.c/d.json", "noext"] {
            let stripped = remove_ext(path).unwrap();
            let again = remove_ext(format!("{}{}", stripped, get_extension(path))).unwrap();
            assert_eq!(again, stripped);
        }
    }

    #[test]
    fn test_add_extension_if_needed() {
        assert_eq!(add_extension_if_needed("x", ".txt"), "x.txt");
        assert_eq!(add_extension_if_needed("x.txt", ".txt"), "x.txt");
        let once = add_extension_if_needed("x", ".nii.gz");
        assert_eq!(add_extension_if_needed(&once, ".nii.gz"), once);
    }

    #[test]
    fn test_rename_positional() {
        let renamed = rename(["a/b.nii.gz"], None).unwrap();
        assert_eq!(renamed, Renamed::One(Utf8PathBuf::from("a/b_000.nii.gz")));
        assert_eq!(renamed.into_vec(), vec![Utf8PathBuf::from("a/b_000.nii.gz")]);

        let renamed = rename(["a/b.nii.gz", "c.txt"], None).unwrap();
        assert_eq!(
            renamed,
            Renamed::Many(vec!["a/b_000.nii.gz".into(), "c_001.txt".into()])
        );
    }

    #[test]
    fn test_rename_suffix() {
        let renamed = rename(["a/b.nii.gz"], Some("_trim")).unwrap();
        assert_eq!(renamed.into_vec(), vec![Utf8PathBuf::from("a/b_trim.nii.gz")]);
    }

    #[test]
    fn test_fname_presuffix() {
        let out = fname_presuffix("in/rest.nii.gz", "w", "_mni", Some(Utf8Path::new("out")))
            .unwrap();
        assert_eq!(out, Utf8Path::new("out/wrest_mni.nii.gz"));
    }
}
