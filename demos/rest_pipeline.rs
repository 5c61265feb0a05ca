//! Builds a resting-state preprocessing workflow for one synthetic subject,
//! runs it and prints the executed graph.
//!
//! ```sh
//! cargo run --example rest_pipeline --features logging
//! ```

use camino::Utf8PathBuf;
use ndarray::{ArrayD, IxDyn};
use neuropipe::image::new_image;
use neuropipe::interfaces::{DataSink, SelectFiles};
use neuropipe::{Node, RunConfig, Workflow, attach_rest_preprocessing};

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    neuropipe::utils::init_logging();

    let scratch = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(scratch.path().to_path_buf())?;
    let data = root.join("data");

    let rest = data.join("sub-01/func/rest.nii.gz");
    std::fs::create_dir_all(data.join("sub-01/func"))?;
    let series = ArrayD::from_shape_fn(IxDyn(&[8, 8, 12, 20]), |ix| {
        (ix[0] + ix[1] + ix[2]) as f32 + (ix[3] as f32 * 0.3).sin()
    });
    let mut image = new_image(series, [3.0, 3.0, 3.5]);
    image.header.pixdim[4] = 2.5;
    image.header.slice_code = 3;
    image.save(&rest)?;

    let mut wf = Workflow::new("main");
    wf.add_node(
        Node::new(
            "input_files",
            SelectFiles::new([("rest", "{subject_id}/func/rest.nii.gz")]).base_directory(&data),
        )
        .with_input("subject_id", "sub-01"),
    )?;
    wf.add_node(
        Node::new("datasink", DataSink::new())
            .with_input(DataSink::BASE_DIRECTORY, root.join("out"))
            .with_input(DataSink::CONTAINER, "sub-01"),
    )?;

    let attached = attach_rest_preprocessing(&mut wf, "rest_preproc")?;
    for (pattern, replacement) in &attached.substitutions {
        println!("{pattern} -> {replacement}");
    }

    let report = wf.run(&RunConfig::new(root.join("work")))?;

    if let Some(sink) = report.output("datasink") {
        for file in sink.files("out_file")? {
            println!("staged {file}");
        }
    }

    println!("{}", report.render_mermaid(&wf));
    Ok(())
}
