use std::collections::BTreeMap;

use crate::error::LookupError;
use crate::interfaces::SelectFiles;
use crate::workflow::{NodeId, Workflow};

/// Conventional name of the file selector feeding a workflow.
pub const INPUT_NODE: &str = "input_files";

/// Conventional name of the results sink of a workflow.
pub const DATASINK: &str = "datasink";

/// Finds the node called `name`.
///
/// An exact match wins. Otherwise every node whose name contains `name`,
/// ignoring case, is a candidate, and exactly one candidate must remain.
pub fn find_node(workflow: &Workflow, name: &str) -> Result<NodeId, LookupError> {
    if let Some(id) = workflow.node_named(name) {
        return Ok(id);
    }

    let needle = name.to_lowercase();
    let mut candidates: Vec<(NodeId, &str)> = workflow
        .nodes()
        .filter(|(_, node)| node.name().to_lowercase().contains(&needle))
        .map(|(id, node)| (id, node.name()))
        .collect();

    match candidates.len() {
        0 => Err(LookupError::NotFound(name.to_string())),
        1 => Ok(candidates.remove(0).0),
        _ => Err(LookupError::Ambiguous {
            name: name.to_string(),
            candidates: candidates.into_iter().map(|(_, n)| n.to_string()).collect(),
        }),
    }
}

/// The file selector of `workflow`, named [`INPUT_NODE`].
pub fn get_input_node(workflow: &Workflow) -> Result<NodeId, LookupError> {
    find_node(workflow, INPUT_NODE)
}

/// The results sink of `workflow`, named [`DATASINK`].
pub fn get_datasink(workflow: &Workflow) -> Result<NodeId, LookupError> {
    find_node(workflow, DATASINK)
}

/// A new list with `current` followed by `new_items`; `current` is untouched.
pub fn extend_list_setting<T: Clone>(current: &[T], new_items: impl IntoIterator<Item = T>) -> Vec<T> {
    current.iter().cloned().chain(new_items).collect()
}

/// Replaces `{key}` placeholders in both members of every pair.
pub fn format_pair_list<K, V>(
    pairs: &[(&str, &str)],
    vars: impl IntoIterator<Item = (K, V)>,
) -> Vec<(String, String)>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let vars: BTreeMap<String, String> = vars
        .into_iter()
        .map(|(k, v)| (format!("{{{}}}", k.as_ref()), v.as_ref().to_string()))
        .collect();

    let format = |text: &str| {
        vars.iter()
            .fold(text.to_string(), |acc, (key, value)| acc.replace(key, value))
    };

    pairs
        .iter()
        .map(|&(pattern, replacement)| (format(pattern), format(replacement)))
        .collect()
}

/// The file template that the selector node `id` declares for `field`.
pub fn input_file_name(workflow: &Workflow, id: NodeId, field: &str) -> Result<String, LookupError> {
    let node = workflow
        .node(id)
        .map_err(|_| LookupError::NotFound(format!("#{}", id.index())))?;

    node.interface_as::<SelectFiles>()
        .and_then(|select| select.template(field))
        .map(str::to_string)
        .ok_or_else(|| LookupError::Field {
            node: node.name().to_string(),
            field: field.to_string(),
        })
}
