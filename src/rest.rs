//! Resting-state fMRI preprocessing assembled as a subgraph.
//!
//! ```text
//! input_files.rest ──► <name>.rest_input ──► <name>.trim ──► <name>.st_params
//!                                                 │                 │
//!                                                 ▼                 │
//!                                          <name>.rest_output      │
//!                                                 │                 │
//!                      datasink.rest.@trim ◄──────┘                 │
//!                      datasink.rest.@stc_params ◄──────────────────┘
//! ```

use camino::Utf8Path;

use crate::error::{AttachError, GraphError, LookupError};
use crate::files::remove_ext;
use crate::interfaces::{DataSink, IdentityInterface, SliceTimingParams, Trim};
use crate::workflow::{
    Embedded, Node, NodeId, Value, Workflow, extend_list_setting, find_node, format_pair_list,
    get_datasink, get_input_node, input_file_name,
};

pub const DEFAULT_NAME: &str = "rest_preproc";

pub const REST_INPUT: &str = "rest_input";
pub const TRIM: &str = "trim";
pub const ST_PARAMS: &str = "st_params";
pub const REST_OUTPUT: &str = "rest_output";

/// Volumes dropped from the start of every resting-state series.
pub const TRIM_BEGIN: usize = 6;

/// Rewrite rules registered against the sink, `{rest}` is the escaped base
/// name of the resting-state input.
const SUBSTITUTIONS: [(&str, &str); 2] = [
    (r"/{rest}_trim\.nii(\.gz)?$", "/rest_trim.nii$1"),
    (r"/slice_timing_params\.json$", "/rest_stc_params.json"),
];

/// Anatomical outputs of the containing workflow, staged next to the rest
/// results when the nodes producing them exist.
const ANAT_OUTPUTS: [(&str, &[(&str, &str)]); 2] = [
    ("warp_anat", &[("normalized_files", "anat.@mni")]),
    (
        "new_segment",
        &[
            ("modulated_class_images", "anat.tissues.@warped"),
            ("native_class_images", "anat.tissues.@native"),
            ("transformation_mat", "anat.transform.@linear"),
            ("forward_deformation_field", "anat.transform.@forward"),
            ("inverse_deformation_field", "anat.transform.@inverse"),
            ("bias_corrected_images", "anat.@biascor"),
        ],
    ),
];

/// Builds the four-node rest preprocessing graph, unexecuted.
pub fn build_rest_preprocessing_subgraph(name: &str) -> Result<Workflow, GraphError> {
    let mut wf = Workflow::new(name);

    let rest_input = wf.add_node(Node::new(
        REST_INPUT,
        IdentityInterface::new(["rest"]).mandatory(),
    ))?;
    let trim = wf.add_node(Node::new(TRIM, Trim::new(TRIM_BEGIN)))?;
    let st_params = wf.add_node(Node::new(ST_PARAMS, SliceTimingParams::new()))?;
    let rest_output = wf.add_node(Node::new(
        REST_OUTPUT,
        IdentityInterface::new(["rest"]).mandatory(),
    ))?;

    wf.connect(rest_input, "rest", trim, "in_file")?;
    wf.connect(trim, "out_file", st_params, "in_file")?;
    wf.connect(trim, "out_file", rest_output, "rest")?;

    Ok(wf)
}

/// What [`attach_rest_preprocessing_to`] added to the containing workflow.
#[derive(Debug, Clone)]
pub struct RestAttachment {
    pub subgraph: Embedded,
    /// Base name of the resting-state input, extension stripped.
    pub base_name: String,
    /// Rules appended to the sink's `regexp_substitutions`.
    pub substitutions: Vec<(String, String)>,
    /// Anatomical nodes whose outputs were wired to the sink.
    pub anatomical: Vec<NodeId>,
}

/// Attaches the rest preprocessing to the conventional `input_files` and
/// `datasink` nodes of `main`.
pub fn attach_rest_preprocessing(
    main: &mut Workflow,
    name: &str,
) -> Result<RestAttachment, AttachError> {
    let input = get_input_node(main)?;
    let sink = get_datasink(main)?;
    attach_rest_preprocessing_to(main, input, sink, name)
}

/// Embeds the rest preprocessing subgraph in `main` between the file selector
/// `input` and the results sink `sink`.
///
/// The wiring is assembled on a copy of `main` and only swapped in once every
/// step succeeded, a failed attach leaves `main` as it was.
pub fn attach_rest_preprocessing_to(
    main: &mut Workflow,
    input: NodeId,
    sink: NodeId,
    name: &str,
) -> Result<RestAttachment, AttachError> {
    let mut staged = main.clone();
    let attachment = assemble(&mut staged, input, sink, name)?;
    *main = staged;
    Ok(attachment)
}

fn assemble(
    main: &mut Workflow,
    input: NodeId,
    sink: NodeId,
    name: &str,
) -> Result<RestAttachment, AttachError> {
    let template = input_file_name(main, input, "rest")?;
    let file_name = Utf8Path::new(&template).file_name().unwrap_or(&template);
    let base_name = remove_ext(file_name)?;

    let substitutions = format_pair_list(&SUBSTITUTIONS, [("rest", regex::escape(&base_name))]);
    register_substitutions(main, sink, &substitutions)?;

    let subgraph = main.add_workflow(build_rest_preprocessing_subgraph(name)?)?;

    main.connect(input, "rest", subgraph.get(REST_INPUT)?, "rest")?;
    main.connect(subgraph.get(REST_OUTPUT)?, "rest", sink, "rest.@trim")?;
    main.connect(subgraph.get(ST_PARAMS)?, "params_file", sink, "rest.@stc_params")?;

    let mut anatomical = Vec::new();
    for (node, outputs) in ANAT_OUTPUTS {
        let id = match find_node(main, node) {
            Ok(id) => id,
            Err(LookupError::NotFound(_)) => {
                tracing::debug!("No '{node}' node in '{}', not staging it", main.name());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        for (output, slot) in outputs.iter() {
            main.connect(id, output, sink, slot)?;
        }
        anatomical.push(id);
    }

    tracing::debug!(
        workflow = main.name(),
        subgraph = name,
        %base_name,
        "attached rest preprocessing"
    );

    Ok(RestAttachment {
        subgraph,
        base_name,
        substitutions,
        anatomical,
    })
}

/// Appends `rules` to the sink's preset regex substitutions.
fn register_substitutions(
    main: &mut Workflow,
    sink: NodeId,
    rules: &[(String, String)],
) -> Result<(), GraphError> {
    let node = main.node_mut(sink)?;

    let current = match node.input(DataSink::REGEXP_SUBSTITUTIONS) {
        Some(Value::Pairs(pairs)) => pairs.as_slice(),
        _ => &[],
    };
    let merged = extend_list_setting(current, rules.iter().cloned());

    node.set_input(DataSink::REGEXP_SUBSTITUTIONS, Value::Pairs(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::SelectFiles;

    fn main_workflow() -> Workflow {
        let mut wf = Workflow::new("main");
        wf.add_node(Node::new(
            "input_files",
            SelectFiles::new([
                ("rest", "{subject_id}/func/rest_run1.nii.gz"),
                ("anat", "{subject_id}/anat.nii.gz"),
            ]),
        ))
        .unwrap();
        wf.add_node(Node::new("datasink", DataSink::new()).with_input(
            DataSink::REGEXP_SUBSTITUTIONS,
            Value::Pairs(vec![("_subject_id_".into(), "".into())]),
        ))
        .unwrap();
        wf
    }

    fn sink_rules(wf: &Workflow) -> Vec<(String, String)> {
        let sink = get_datasink(wf).unwrap();
        wf.node(sink)
            .unwrap()
            .inputs()
            .pairs(DataSink::REGEXP_SUBSTITUTIONS)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_subgraph_shape() {
        let wf = build_rest_preprocessing_subgraph("rest_preproc").unwrap();
        assert_eq!(wf.name(), "rest_preproc");
        assert_eq!(wf.len(), 4);

        let mut edges: Vec<(String, String, String, String)> = wf
            .connections()
            .map(|(s, d, c)| {
                (
                    wf.node(s).unwrap().name().to_string(),
                    c.source.clone(),
                    wf.node(d).unwrap().name().to_string(),
                    c.dest.clone(),
                )
            })
            .collect();
        edges.sort();

        let expected: Vec<(String, String, String, String)> = [
            ("rest_input", "rest", "trim", "in_file"),
            ("trim", "out_file", "rest_output", "rest"),
            ("trim", "out_file", "st_params", "in_file"),
        ]
        .iter()
        .map(|(s, so, d, di)| (s.to_string(), so.to_string(), d.to_string(), di.to_string()))
        .collect();
        assert_eq!(edges, expected);

        let trim = wf.node_named(TRIM).unwrap();
        let trim = wf.node(trim).unwrap().interface_as::<Trim>().unwrap();
        assert_eq!(trim.begin_index, 6);
    }

    #[test]
    fn test_attach_wires_and_merges() {
        let mut wf = main_workflow();
        let attached = attach_rest_preprocessing(&mut wf, DEFAULT_NAME).unwrap();

        assert_eq!(attached.base_name, "rest_run1");
        assert!(attached.anatomical.is_empty());
        assert_eq!(wf.len(), 6);

        let rules = sink_rules(&wf);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], ("_subject_id_".to_string(), "".to_string()));
        assert_eq!(rules[1].0, r"/rest_run1_trim\.nii(\.gz)?$");
        assert_eq!(rules[1].1, "/rest_trim.nii$1");

        let input = get_input_node(&wf).unwrap();
        let rest_input = attached.subgraph.get(REST_INPUT).unwrap();
        assert_eq!(wf.upstream(rest_input), vec![input]);

        let sink = get_datasink(&wf).unwrap();
        let slots: Vec<&str> = wf.incoming(sink).map(|(_, c)| c.dest.as_str()).collect();
        assert!(slots.contains(&"rest.@trim"));
        assert!(slots.contains(&"rest.@stc_params"));
    }

    #[test]
    fn test_failed_attach_leaves_workflow_untouched() {
        let mut wf = main_workflow();
        attach_rest_preprocessing(&mut wf, "rest_a").unwrap();
        let nodes = wf.len();
        let edges = wf.connections().count();
        let rules = sink_rules(&wf);

        // the sink slots are already taken by the first attach
        let err = attach_rest_preprocessing(&mut wf, "rest_b").unwrap_err();
        assert!(matches!(
            err,
            AttachError::Graph(GraphError::AlreadyConnected { .. })
        ));

        assert_eq!(wf.len(), nodes);
        assert_eq!(wf.connections().count(), edges);
        assert_eq!(sink_rules(&wf), rules);
        assert_eq!(rules.len(), 3);
        assert!(wf.node_named("rest_b.trim").is_none());
    }

    #[test]
    fn test_attach_stages_anatomical_outputs() {
        let mut wf = main_workflow();
        let warp = wf
            .add_node(Node::new(
                "warp_anat",
                IdentityInterface::new(["normalized_files"]),
            ))
            .unwrap();
        let segment = wf
            .add_node(Node::new(
                "new_segment",
                IdentityInterface::new([
                    "modulated_class_images",
                    "native_class_images",
                    "transformation_mat",
                    "forward_deformation_field",
                    "inverse_deformation_field",
                    "bias_corrected_images",
                ]),
            ))
            .unwrap();

        let attached = attach_rest_preprocessing(&mut wf, DEFAULT_NAME).unwrap();
        assert_eq!(attached.anatomical, vec![warp, segment]);

        let sink = get_datasink(&wf).unwrap();
        assert_eq!(wf.incoming(sink).count(), 2 + 7);
        assert!(
            wf.incoming(sink)
                .any(|(id, c)| id == segment && c.dest == "anat.tissues.@warped")
        );
    }

    #[test]
    fn test_attach_needs_conventional_nodes() {
        let mut wf = Workflow::new("main");
        wf.add_node(Node::new("datasink", DataSink::new())).unwrap();

        let err = attach_rest_preprocessing(&mut wf, DEFAULT_NAME).unwrap_err();
        assert!(matches!(err, AttachError::Lookup(LookupError::NotFound(_))));
        assert_eq!(wf.len(), 1);
    }
}
