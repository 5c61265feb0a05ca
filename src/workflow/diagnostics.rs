use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::workflow::{NodeId, Values, Workflow};

#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of [`Workflow::run`].
#[derive(Debug, Default)]
pub struct Report {
    /// Outputs of every node, keyed by full node name.
    pub outputs: BTreeMap<String, Values>,
    /// Timing of the nodes that actually ran.
    pub execution_times: HashMap<NodeId, NodeExecution>,
    /// Nodes whose stored result was reused.
    pub cached: HashSet<NodeId>,
}

impl Report {
    pub fn output(&self, node: &str) -> Option<&Values> {
        self.outputs.get(node)
    }

    /// Renders the workflow as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    pub fn render_mermaid(&self, workflow: &Workflow) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(workflow, &mut f);
        f
    }

    fn write_mermaid(&self, workflow: &Workflow, f: &mut String) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (id, node) in workflow.nodes() {
            let name = node.name().replace('"', "\\\"");

            let (label_extra, color_code) = match times.get(&id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None if self.cached.contains(&id) => ("Cached".to_string(), "#ADD8E6".to_string()),
                None => ("Not run".to_string(), "#D3D3D3".to_string()),
            };

            writeln!(f, "    {:?}[\"{}\\n{}\"]", id.index(), name, label_extra)?;
            writeln!(f, "    style {:?} fill:{}", id.index(), color_code)?;
        }

        for (source, target, connection) in workflow.connections() {
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                connection.dest.replace('@', "#64;"),
                target.index()
            )?;
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
