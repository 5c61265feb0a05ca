use std::collections::HashMap;
use std::fs;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use serde::{Deserialize, Serialize};
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::RunConfig;
use crate::error::{GraphError, RunError};
use crate::hash::{Fingerprint, Hash32};
use crate::utils::{as_overhead, get_style_node, get_style_run};
use crate::workflow::{NodeContext, NodeExecution, NodeId, Report, Values, Workflow};

/// Stored next to the artifacts of a node as `_result.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResult {
    kind: String,
    hash: String,
    outputs: Values,
}

const RESULT_FILE: &str = "_result.json";

/// Result of one node, as sent back to the scheduler.
struct Executed {
    outputs: Values,
    start: Instant,
    duration: Duration,
    ran: bool,
}

impl Workflow {
    /// Executes every node in dependency order.
    ///
    /// Each node gets its own working directory under
    /// `<base_dir>/<workflow>/<node path>`. The first failing node stops the
    /// run, nodes already running are allowed to finish, and nothing that
    /// depends on the failure is started. Partial outputs stay on disk.
    pub fn run(&self, config: &RunConfig) -> Result<Report, RunError> {
        // We run toposort primarily to detect any cycles in the graph.
        let order = self.toposort().map_err(|e| match e {
            GraphError::Cycle { from, .. } => RunError::Cycle(self.name().to_string(), from),
            other => RunError::Node(self.name().to_string(), other.into()),
        })?;

        super::check_name(self.name())
            .map_err(|e| RunError::Node(self.name().to_string(), e.into()))?;

        if order.is_empty() {
            return Ok(Report::default());
        }

        let s = Instant::now();

        let root_span = tracing::span!(Level::INFO, "running_workflow", workflow = self.name());
        root_span.pb_set_length(order.len() as u64);
        root_span.pb_set_style(&get_style_run()?);
        root_span.pb_set_message(&format!("Running {}...", self.name()));
        let _enter = root_span.enter();

        let node_style = get_style_node()?;

        let report = if config.parallel {
            self.run_parallel(config, &root_span, &node_style)?
        } else {
            self.run_sequential(&order, config, &root_span, &node_style)?
        };

        tracing::info!(
            "Finished workflow {} ({} run, {} cached) {}",
            self.name(),
            report.execution_times.len(),
            report.cached.len(),
            as_overhead(s)
        );

        Ok(report)
    }

    fn run_sequential(
        &self,
        order: &[NodeId],
        config: &RunConfig,
        root_span: &Span,
        style: &ProgressStyle,
    ) -> Result<Report, RunError> {
        let mut outputs = HashMap::new();
        let mut report = Report::default();

        for &id in order {
            let inputs = self.gather_inputs(id, &outputs)?;
            let executed = self.execute(id, inputs, config, root_span, style)?;
            self.record(id, executed, &mut outputs, &mut report);
            root_span.pb_inc(1);
        }

        Ok(report)
    }

    /// Runs the graph on the rayon pool, starting each node as soon as all of
    /// its upstream nodes have finished.
    ///
    /// 1. Every node gets a count of its distinct upstream nodes.
    /// 2. Nodes with a zero count are spawned right away.
    /// 3. The calling thread waits on a channel for finished nodes. When it is
    ///    itself a pool worker it runs queued nodes while it waits.
    /// 4. A finished node decrements the count of each downstream node, and
    ///    nodes reaching zero are spawned.
    /// 5. The loop ends when every node has reported back, or on the first
    ///    error.
    fn run_parallel(
        &self,
        config: &RunConfig,
        root_span: &Span,
        style: &ProgressStyle,
    ) -> Result<Report, RunError> {
        let mut dependency_counts: HashMap<NodeId, usize> = self
            .node_ids()
            .map(|id| (id, self.upstream(id).len()))
            .collect();

        let total = dependency_counts.len();
        let mut completed = 0;

        let mut outputs: HashMap<NodeId, Values> = HashMap::new();
        let mut report = Report::default();

        rayon::in_place_scope(|s| -> Result<(), RunError> {
            let (sender, receiver) = channel::<(NodeId, Result<Executed, RunError>)>();

            let spawn = |outputs: &HashMap<NodeId, Values>, id: NodeId| {
                let inputs = self.gather_inputs(id, outputs);
                let sender = sender.clone();

                s.spawn(move |_| {
                    let result =
                        inputs.and_then(|inputs| self.execute(id, inputs, config, root_span, style));
                    // the receiver is gone only after an earlier failure
                    let _ = sender.send((id, result));
                });
            };

            for (&id, &count) in &dependency_counts {
                if count == 0 {
                    spawn(&outputs, id);
                }
            }

            while completed < total {
                let (id, result) = wait(&receiver)?;

                self.record(id, result?, &mut outputs, &mut report);
                completed += 1;
                root_span.pb_inc(1);

                for dependent in self.downstream(id) {
                    if let Some(count) = dependency_counts.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            spawn(&outputs, dependent);
                        }
                    }
                }
            }

            Ok(())
        })?;

        Ok(report)
    }

    fn record(
        &self,
        id: NodeId,
        executed: Executed,
        outputs: &mut HashMap<NodeId, Values>,
        report: &mut Report,
    ) {
        let name = self.graph[id.0].name.clone();

        if executed.ran {
            report.execution_times.insert(
                id,
                NodeExecution {
                    start: executed.start,
                    duration: executed.duration,
                },
            );
        } else {
            report.cached.insert(id);
        }

        report.outputs.insert(name, executed.outputs.clone());
        outputs.insert(id, executed.outputs);
    }

    /// Preset inputs of `id` overlaid with the values arriving on its
    /// connections.
    fn gather_inputs(&self, id: NodeId, outputs: &HashMap<NodeId, Values>) -> Result<Values, RunError> {
        let mut inputs = self.graph[id.0].inputs.clone();

        for (source, connection) in self.incoming(id) {
            let value = outputs
                .get(&source)
                .and_then(|values| values.get(&connection.source))
                .ok_or_else(|| RunError::MissingOutput {
                    node: self.graph[source.0].name.clone(),
                    slot: connection.source.clone(),
                })?;

            inputs.set(connection.dest.clone(), value.clone());
        }

        Ok(inputs)
    }

    fn work_dir(&self, config: &RunConfig, id: NodeId) -> Utf8PathBuf {
        let mut dir = config.base_dir.join(self.name());
        for part in self.graph[id.0].name.split('.') {
            dir.push(part);
        }
        dir
    }

    fn execute(
        &self,
        id: NodeId,
        inputs: Values,
        config: &RunConfig,
        root_span: &Span,
        style: &ProgressStyle,
    ) -> Result<Executed, RunError> {
        let node = &self.graph[id.0];

        for slot in node.interface.mandatory_inputs() {
            if !inputs.contains(slot) {
                return Err(RunError::MissingInput {
                    node: node.name.clone(),
                    slot: slot.to_string(),
                });
            }
        }

        let work_dir = self.work_dir(config, id);
        fs::create_dir_all(&work_dir)?;

        let hash = fingerprint(node.kind(), &node.interface.settings(), &inputs)?;
        let result_path = work_dir.join(RESULT_FILE);

        if config.use_cache
            && let Some(outputs) = load_cached(&result_path, hash)
        {
            tracing::debug!(node = %node.name, "reusing stored result");
            return Ok(Executed {
                outputs,
                start: Instant::now(),
                duration: Duration::ZERO,
                ran: false,
            });
        }

        let span = tracing::span!(parent: root_span, Level::INFO, "node", name = %node.name);
        span.pb_set_style(style);
        span.pb_set_message(&format!("Running {}", node.name));
        let _enter = span.enter();

        let ctx = NodeContext {
            name: node.name.clone(),
            work_dir,
            span: span.clone(),
        };

        let start = Instant::now();

        // Interfaces only read their inputs and write into their own working
        // directory, a panic cannot leave shared state half-updated.
        let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            node.interface.run(&ctx, &inputs)
        })) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Node panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Node panicked: {s}")
                } else {
                    String::from("Node panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        let duration = start.elapsed();
        let outputs = result.map_err(|e| RunError::Node(node.name.clone(), e))?;

        let stored = StoredResult {
            kind: node.kind().to_string(),
            hash: hash.to_hex(),
            outputs,
        };
        fs::write(&result_path, serde_json::to_string_pretty(&stored)?)?;

        tracing::info!("Finished {} {}", node.name, as_overhead(start));

        Ok(Executed {
            outputs: stored.outputs,
            start,
            duration,
            ran: true,
        })
    }
}

/// Next message from the node jobs.
///
/// Never parks a pool worker while jobs are queued: on a single-threaded pool
/// the waiting thread is the only one that can run them.
fn wait<T>(receiver: &Receiver<T>) -> Result<T, RunError> {
    loop {
        match receiver.try_recv() {
            Ok(message) => return Ok(message),
            Err(TryRecvError::Disconnected) => return Err(RunError::Disconnected),
            Err(TryRecvError::Empty) => {}
        }

        if matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
            continue;
        }

        match receiver.recv_timeout(Duration::from_millis(5)) {
            Ok(message) => return Ok(message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(RunError::Disconnected),
        }
    }
}

/// Hash of the node kind, the interface settings, its inputs, and the size and
/// mtime of every input file.
fn fingerprint(
    kind: &str,
    settings: &serde_json::Value,
    inputs: &Values,
) -> Result<Hash32, RunError> {
    let mut hasher = Fingerprint::default();
    hasher
        .update(kind)
        .update(serde_json::to_vec(settings)?)
        .update(serde_json::to_vec(inputs)?);

    for (_, value) in inputs.iter() {
        for file in value.files() {
            hasher.update_file(file);
        }
    }

    Ok(hasher.finish())
}

/// The stored outputs, if the hash matches and every output file still exists.
fn load_cached(path: &Utf8Path, hash: Hash32) -> Option<Values> {
    let text = fs::read_to_string(path).ok()?;
    let stored: StoredResult = serde_json::from_str(&text).ok()?;

    let intact = stored
        .outputs
        .iter()
        .flat_map(|(_, value)| value.files())
        .all(|file| file.exists());

    (stored.hash == hash.to_hex() && intact).then_some(stored.outputs)
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::image::Image;
    use crate::image::testing::{tmp, write_series};
    use crate::interfaces::{IdentityInterface, Trim};
    use crate::workflow::{Interface, Node, SlotSpec};

    /// Appends its name to the `trail` input and counts its runs.
    #[derive(Debug, Default)]
    struct Append {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Interface for Append {
        fn kind(&self) -> &'static str {
            "append"
        }

        fn input_slots(&self) -> SlotSpec {
            SlotSpec::fixed(["trail"])
        }

        fn output_slots(&self) -> SlotSpec {
            SlotSpec::fixed(["trail"])
        }

        fn mandatory_inputs(&self) -> Vec<&'static str> {
            vec!["trail"]
        }

        fn run(&self, ctx: &NodeContext, inputs: &Values) -> anyhow::Result<Values> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "refusing to run");
            let trail = format!("{}/{}", inputs.text("trail")?, ctx.name);
            Ok(Values::new().with("trail", trail))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn chain(runs: &Arc<AtomicUsize>, fail_b: bool) -> Workflow {
        let mut wf = Workflow::new("chain");
        let a = wf
            .add_node(
                Node::new("a", Append { runs: runs.clone(), fail: false }).with_input("trail", "start"),
            )
            .unwrap();
        let b = wf
            .add_node(Node::new("b", Append { runs: runs.clone(), fail: fail_b }))
            .unwrap();
        let c = wf
            .add_node(Node::new("c", Append { runs: runs.clone(), fail: false }))
            .unwrap();
        wf.connect(a, "trail", b, "trail").unwrap();
        wf.connect(b, "trail", c, "trail").unwrap();
        wf
    }

    #[test]
    fn test_runs_in_order() {
        let (_guard, dir) = tmp();
        let runs = Arc::new(AtomicUsize::new(0));
        let wf = chain(&runs, false);

        for parallel in [true, false] {
            let config = RunConfig {
                base_dir: dir.join(if parallel { "par" } else { "seq" }),
                use_cache: false,
                parallel,
            };
            let report = wf.run(&config).unwrap();
            let trail = report.output("c").unwrap().text("trail").unwrap().to_string();
            assert_eq!(trail, "start/a/b/c");
            assert!(config.base_dir.join("chain/b/_result.json").exists());
        }

        assert_eq!(runs.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_single_worker_pool() {
        let (_guard, dir) = tmp();
        let runs = Arc::new(AtomicUsize::new(0));
        let wf = chain(&runs, false);
        let config = RunConfig {
            base_dir: dir,
            use_cache: false,
            parallel: true,
        };

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let report = pool.install(|| wf.run(&config)).unwrap();

        let trail = report.output("c").unwrap().text("trail").unwrap().to_string();
        assert_eq!(trail, "start/a/b/c");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cache_reuses_results() {
        let (_guard, dir) = tmp();
        let runs = Arc::new(AtomicUsize::new(0));
        let wf = chain(&runs, false);
        let config = RunConfig::new(dir.clone());

        let first = wf.run(&config).unwrap();
        assert_eq!(first.execution_times.len(), 3);

        let second = wf.run(&config).unwrap();
        assert_eq!(second.cached.len(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(first.outputs, second.outputs);

        let diagram = second.render_mermaid(&wf);
        assert!(diagram.contains("Cached"));
    }

    #[test]
    fn test_changed_settings_invalidate_cache() {
        let (_guard, dir) = tmp();
        let in_file = dir.join("rest.nii.gz");
        write_series(&in_file, [2, 2, 2, 10], |_, _, _, t| t as f32);
        let config = RunConfig::new(dir.join("work"));

        let trimmed = |begin: usize| {
            let mut wf = Workflow::new("main");
            wf.add_node(Node::new("trim", Trim::new(begin)).with_input("in_file", in_file.clone()))
                .unwrap();
            wf.run(&config).unwrap()
        };

        let first = trimmed(6);
        let out_file = first.output("trim").unwrap().file("out_file").unwrap();
        assert_eq!(Image::open(out_file).unwrap().n_volumes(), 4);

        let second = trimmed(2);
        assert!(second.cached.is_empty());
        let out_file = second.output("trim").unwrap().file("out_file").unwrap();
        assert_eq!(Image::open(out_file).unwrap().n_volumes(), 8);

        assert_eq!(trimmed(2).cached.len(), 1);
    }

    #[test]
    fn test_failure_stops_dependents() {
        let (_guard, dir) = tmp();
        let runs = Arc::new(AtomicUsize::new(0));
        let wf = chain(&runs, true);

        let err = wf.run(&RunConfig::new(dir)).unwrap_err();
        assert!(matches!(&err, RunError::Node(name, _) if name == "b"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_mandatory_input() {
        let (_guard, dir) = tmp();
        let mut wf = Workflow::new("single");
        wf.add_node(Node::new("a", Append::default())).unwrap();

        let err = wf.run(&RunConfig::new(dir)).unwrap_err();
        assert!(matches!(err, RunError::MissingInput { ref slot, .. } if slot == "trail"));
    }

    #[test]
    fn test_nested_work_dir() {
        let (_guard, dir) = tmp();
        let mut wf = Workflow::new("main");
        let mut sub = Workflow::new("rest");
        sub.add_node(Node::new("input", IdentityInterface::new(["x"])).with_input("x", 1i64))
            .unwrap();
        wf.add_workflow(sub).unwrap();

        let config = RunConfig::new(dir.clone());
        let report = wf.run(&config).unwrap();
        assert_eq!(report.output("rest.input").unwrap().int("x").unwrap(), 1);
        assert!(dir.join("main/rest/input/_result.json").exists());
    }
}
