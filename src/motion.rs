//! Motion statistics of many runs collected into one sheet.
//!
//! Artifact detection writes one `motion_stats.json` per run, a JSON array
//! whose second element maps outlier counts by kind and whose fourth holds a
//! `motion_norm` object. [`motion_stats_sheet`] finds every such file under a
//! path template like `out/{group}/{subject_id}/rest/motion_stats.json` and
//! turns each into a row: the template field values first, then the outlier
//! counts, then the motion norms as `<name>_motion_norm`.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{Pattern, glob};
use regex::Regex;
use serde_json::Value;

use crate::error::MotionError;

/// One row per statistics file, columns in the order of the first row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionSheet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl MotionSheet {
    /// Writes the sheet as comma separated values with a header line.
    pub fn write_csv(&self, path: impl AsRef<Utf8Path>) -> Result<(), MotionError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .from_path(path.as_ref())?;

        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(cell))?;
        }
        writer.flush()?;

        Ok(())
    }

    /// The values of `column`, `None` for rows that lack it.
    pub fn column(&self, column: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c == column)?;
        Some(self.rows.iter().map(|row| &row[index]).collect())
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Collects every statistics file matching `template` into a sheet.
///
/// `template` may hold `{field}` placeholders, each matching one path
/// component. `fields` selects which of them become leading columns.
pub fn motion_stats_sheet(template: &str, fields: &[&str]) -> Result<MotionSheet, MotionError> {
    let layout = Layout::parse(template)?;
    for field in fields {
        if !layout.names.iter().any(|name| name == field) {
            return Err(MotionError::Field {
                field: field.to_string(),
                template: template.to_string(),
            });
        }
    }

    let mut files = Vec::new();
    for path in glob(&layout.pattern)? {
        files.push(Utf8PathBuf::try_from(path?)?);
    }
    files.sort();

    if files.is_empty() {
        return Err(MotionError::NoFiles(template.to_string()));
    }

    let mut sheet = MotionSheet::default();
    for file in &files {
        let captures = layout
            .regex
            .captures(file.as_str())
            .ok_or_else(|| MotionError::Layout {
                path: file.clone(),
                reason: format!("does not match '{template}'"),
            })?;

        let mut record: Vec<(String, Value)> = fields
            .iter()
            .map(|&field| (field.to_string(), Value::from(&captures[field])))
            .collect();
        record.extend(read_stats(file)?);

        if sheet.columns.is_empty() {
            sheet.columns = record.iter().map(|(name, _)| name.clone()).collect();
        }

        let row = sheet
            .columns
            .iter()
            .map(|column| {
                record
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(Value::Null)
            })
            .collect();
        sheet.rows.push(row);
    }

    tracing::debug!(files = files.len(), "collected motion statistics");
    Ok(sheet)
}

/// Outlier counts followed by the motion norms of one statistics file.
fn read_stats(path: &Utf8Path) -> Result<Vec<(String, Value)>, MotionError> {
    let layout = |reason: &str| MotionError::Layout {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let stats: Value = serde_json::from_str(&fs::read_to_string(path)?)?;

    let outliers = stats
        .get(1)
        .and_then(Value::as_object)
        .ok_or_else(|| layout("element 1 is not an object of outlier counts"))?;
    let norms = stats
        .get(3)
        .and_then(|v| v.get("motion_norm"))
        .and_then(Value::as_object)
        .ok_or_else(|| layout("element 3 has no 'motion_norm' object"))?;

    let mut record: Vec<(String, Value)> = outliers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    record.extend(
        norms
            .iter()
            .map(|(k, v)| (format!("{k}_motion_norm"), v.clone())),
    );

    Ok(record)
}

/// A path template split into a glob pattern and a capturing regex.
struct Layout {
    pattern: String,
    regex: Regex,
    names: Vec<String>,
}

impl Layout {
    fn parse(template: &str) -> Result<Self, MotionError> {
        let placeholder = Regex::new(r"\{(\w+)\}")?;

        let mut pattern = String::new();
        let mut regex = String::from("^");
        let mut names: Vec<String> = Vec::new();
        let mut last = 0;

        for caps in placeholder.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            let literal = &template[last..whole.start()];
            pattern.push_str(&Pattern::escape(literal));
            regex.push_str(&regex::escape(literal));

            let name = &caps[1];
            pattern.push('*');
            // a repeated field must match the same text, checked by the glob only
            if names.iter().any(|n| n == name) {
                regex.push_str("[^/]+");
            } else {
                regex.push_str(&format!("(?P<{name}>[^/]+)"));
                names.push(name.to_string());
            }
            last = whole.end();
        }

        let rest = &template[last..];
        pattern.push_str(&Pattern::escape(rest));
        regex.push_str(&regex::escape(rest));
        regex.push('$');

        Ok(Self {
            pattern,
            regex: Regex::new(&regex)?,
            names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::tmp;

    fn write_stats(path: &Utf8Path, outliers: i64, translation: f64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stats = serde_json::json!([
            {"motion_file": "rp.txt"},
            {"motion_outliers": outliers, "intensity_outliers": 0, "total_outliers": outliers},
            {"motion": []},
            {"motion_norm": {"mean": translation, "std": 0.5}},
        ]);
        fs::write(path, stats.to_string()).unwrap();
    }

    #[test]
    fn test_sheet_rows_follow_files() {
        let (_guard, dir) = tmp();
        write_stats(&dir.join("control/sub-01/rest/motion_stats.json"), 2, 0.1);
        write_stats(&dir.join("patient/sub-02/rest/motion_stats.json"), 5, 0.3);

        let template = format!("{dir}/{{group}}/{{subject_id}}/rest/motion_stats.json");
        let sheet = motion_stats_sheet(&template, &["group", "subject_id"]).unwrap();

        assert_eq!(sheet.columns[..2], ["group", "subject_id"]);
        assert!(sheet.columns.contains(&"mean_motion_norm".to_string()));
        assert_eq!(sheet.rows.len(), 2);

        let subjects = sheet.column("subject_id").unwrap();
        assert_eq!(subjects, [&Value::from("sub-01"), &Value::from("sub-02")]);

        let outliers = sheet.column("motion_outliers").unwrap();
        assert_eq!(outliers, [&Value::from(2), &Value::from(5)]);

        let out = dir.join("motion.csv");
        sheet.write_csv(&out).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("group,subject_id,"));
        assert!(lines.next().unwrap().starts_with("control,sub-01,"));
    }

    #[test]
    fn test_unknown_field_and_empty_match() {
        let (_guard, dir) = tmp();
        let template = format!("{dir}/{{subject_id}}/motion_stats.json");

        assert!(matches!(
            motion_stats_sheet(&template, &["session"]),
            Err(MotionError::Field { .. })
        ));
        assert!(matches!(
            motion_stats_sheet(&template, &["subject_id"]),
            Err(MotionError::NoFiles(_))
        ));
    }

    #[test]
    fn test_malformed_stats() {
        let (_guard, dir) = tmp();
        let path = dir.join("sub-01/motion_stats.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[{}, {}]").unwrap();

        let template = format!("{dir}/{{subject_id}}/motion_stats.json");
        assert!(matches!(
            motion_stats_sheet(&template, &["subject_id"]),
            Err(MotionError::Layout { .. })
        ));
    }
}
