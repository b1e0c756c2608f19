//! End-to-end tests for the Cascade pipeline engine.
//!
//! Each test exercises the full path: build graph -> validate -> execute
//! against a record store -> verify skip/re-run decisions. The recurring
//! scenario: a generate step produces an SDK from a plugin binary, and two
//! publish steps push it to registries only when its content changed.

use std::path::Path;
use std::sync::Arc;

use cascade_pipeline::{
    validate_or_raise, Executor, JsonRecordStore, MemoryRecordStore, PipelineGraph, RunRecordStore,
    Step,
};
use cascade_types::{CascadeError, StepResult};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn executor() -> Executor {
    Executor::new(Arc::new(cascade_exec::LocalCommandRunner::new()))
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// The canonical generate -> (npm, pypi) shape, with shell-builtin commands
/// that log every execution.
fn sdk_pipeline(root: &Path, plugin: &Path) -> PipelineGraph {
    let gen_dir = root.join("work");
    let npm_dir = root.join("work/sdk/nodejs");
    let pypi_dir = root.join("work/sdk/python");

    // The generated SDK derives from the plugin content (`$(< file)` is plain
    // bash, no external binary needed), so a new plugin yields a new output
    // digest and the publishers re-run.
    let gen_command = format!(
        "echo \"$(< {plugin})\" > sdk/nodejs/package.out; \
         echo \"$(< {plugin})\" > sdk/python/package.out; \
         echo ran >> ../generate.log",
        plugin = plugin.display()
    );

    PipelineGraph::build(vec![
        Step::new("generate-sdk", gen_command, &gen_dir)
            .trigger_file(plugin)
            .output_glob("sdk/**"),
        Step::new("publish-npm", "echo ran >> ../../../npm.log", &npm_dir)
            .trigger_output("generate-sdk"),
        Step::new("publish-pypi", "echo ran >> ../../../pypi.log", &pypi_dir)
            .trigger_output("generate-sdk"),
    ])
    .unwrap()
}

// ---------------------------------------------------------------------------
// Idempotence and change propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_run_with_unchanged_input_executes_nothing() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "binary-v1").await.unwrap();
    // The generate command redirects into sdk/ subdirectories, which must
    // exist before it runs.
    tokio::fs::create_dir_all(root.path().join("work/sdk/nodejs"))
        .await
        .unwrap();
    tokio::fs::create_dir_all(root.path().join("work/sdk/python"))
        .await
        .unwrap();

    let graph = sdk_pipeline(root.path(), &plugin);
    validate_or_raise(&graph).unwrap();

    let store: Arc<dyn RunRecordStore> =
        Arc::new(JsonRecordStore::new(root.path().join("records")));
    let exec = executor();

    let first = exec.run(&graph, store.clone()).await.unwrap();
    assert_eq!(first.executed_count(), 3, "first run executes everything");

    let second = exec.run(&graph, store.clone()).await.unwrap();
    assert!(second.all_skipped(), "unchanged input skips everything");
    assert_eq!(line_count(&root.path().join("generate.log")), 1);
    assert_eq!(line_count(&root.path().join("npm.log")), 1);
    assert_eq!(line_count(&root.path().join("pypi.log")), 1);
}

#[tokio::test]
async fn changed_plugin_re_executes_the_whole_chain() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "binary-v1").await.unwrap();
    tokio::fs::create_dir_all(root.path().join("work/sdk/nodejs"))
        .await
        .unwrap();
    tokio::fs::create_dir_all(root.path().join("work/sdk/python"))
        .await
        .unwrap();

    let graph = sdk_pipeline(root.path(), &plugin);
    let store: Arc<dyn RunRecordStore> =
        Arc::new(JsonRecordStore::new(root.path().join("records")));
    let exec = executor();

    exec.run(&graph, store.clone()).await.unwrap();

    tokio::fs::write(&plugin, "binary-v2").await.unwrap();
    let report = exec.run(&graph, store.clone()).await.unwrap();
    assert_eq!(
        report.executed_count(),
        3,
        "new plugin content re-runs generate and both publishers"
    );
    assert_eq!(line_count(&root.path().join("npm.log")), 2);
    assert_eq!(line_count(&root.path().join("pypi.log")), 2);
}

#[tokio::test]
async fn unrelated_step_is_not_re_executed_by_a_change() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "v1").await.unwrap();

    let gen_command = format!(
        "echo \"$(< {})\" > gen.out; echo ran >> ../gen.log",
        plugin.display()
    );
    let graph = PipelineGraph::build(vec![
        Step::new("generate", gen_command, root.path().join("gen"))
            .trigger_file(&plugin)
            .output_glob("*.out"),
        Step::new("publish", "echo ran >> ../pub.log", root.path().join("pub"))
            .trigger_output("generate"),
        // No dependency on the plugin or on generate.
        Step::new("docs", "echo ran >> ../docs.log", root.path().join("docs")),
    ])
    .unwrap();

    let store: Arc<dyn RunRecordStore> = Arc::new(MemoryRecordStore::new());
    let exec = executor();
    exec.run(&graph, store.clone()).await.unwrap();

    tokio::fs::write(&plugin, "v2").await.unwrap();
    let report = exec.run(&graph, store).await.unwrap();

    assert!(matches!(
        report.result("generate").unwrap(),
        StepResult::Executed { .. }
    ));
    assert!(matches!(
        report.result("publish").unwrap(),
        StepResult::Executed { .. }
    ));
    assert!(
        matches!(report.result("docs").unwrap(), StepResult::Skipped { .. }),
        "docs has no dependency on the changed input"
    );
    assert_eq!(line_count(&root.path().join("docs.log")), 1);
}

// ---------------------------------------------------------------------------
// Fingerprint order sensitivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_order_distinguishes_otherwise_identical_steps() {
    let root = TempDir::new().unwrap();
    let a = root.path().join("a.txt");
    let b = root.path().join("b.txt");
    tokio::fs::write(&a, "alpha").await.unwrap();
    tokio::fs::write(&b, "beta").await.unwrap();

    let graph = PipelineGraph::build(vec![
        Step::new("forward", "echo ok", root.path().join("f"))
            .trigger_file(&a)
            .trigger_file(&b),
        Step::new("reversed", "echo ok", root.path().join("r"))
            .trigger_file(&b)
            .trigger_file(&a),
    ])
    .unwrap();

    let store = Arc::new(MemoryRecordStore::new());
    executor()
        .run(&graph, store.clone() as Arc<dyn RunRecordStore>)
        .await
        .unwrap();

    let forward = store.get("forward").await.unwrap().unwrap();
    let reversed = store.get("reversed").await.unwrap().unwrap();
    assert_ne!(
        forward.last_trigger_fingerprint, reversed.last_trigger_fingerprint,
        "same trigger set, different order, different fingerprint"
    );
}

// ---------------------------------------------------------------------------
// Failure isolation and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_publisher_does_not_block_its_sibling() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "v1").await.unwrap();

    let graph = PipelineGraph::build(vec![
        Step::new("generate", "echo out > sdk.out; echo ran >> ../gen.log", root.path().join("gen"))
            .trigger_file(&plugin)
            .output_glob("sdk.out"),
        Step::new("publish-npm", "exit 1", root.path().join("npm"))
            .trigger_output("generate"),
        Step::new("publish-pypi", "echo ran >> ../pypi.log", root.path().join("pypi"))
            .trigger_output("generate"),
    ])
    .unwrap();

    let store: Arc<dyn RunRecordStore> = Arc::new(MemoryRecordStore::new());
    let report = executor().run(&graph, store.clone()).await.unwrap();

    assert!(matches!(
        report.result("publish-npm").unwrap(),
        StepResult::Failed { exit_code: Some(1), .. }
    ));
    assert!(
        matches!(report.result("publish-pypi").unwrap(), StepResult::Executed { .. }),
        "sibling publisher sharing the same upstream still runs"
    );
    assert_eq!(line_count(&root.path().join("pypi.log")), 1);
}

#[tokio::test]
async fn failed_step_retries_on_next_run_while_siblings_skip() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "v1").await.unwrap();

    let graph = PipelineGraph::build(vec![
        Step::new("generate", "echo out > sdk.out", root.path().join("gen"))
            .trigger_file(&plugin)
            .output_glob("sdk.out"),
        Step::new(
            "publish-npm",
            "echo attempt >> ../npm.log; exit 1",
            root.path().join("npm"),
        )
        .trigger_output("generate"),
        Step::new("publish-pypi", "echo ran >> ../pypi.log", root.path().join("pypi"))
            .trigger_output("generate"),
    ])
    .unwrap();

    let store: Arc<dyn RunRecordStore> = Arc::new(MemoryRecordStore::new());
    let exec = executor();
    exec.run(&graph, store.clone()).await.unwrap();

    // Nothing changed, but the failed record forces publish-npm to retry.
    let second = exec.run(&graph, store.clone()).await.unwrap();
    assert!(matches!(
        second.result("generate").unwrap(),
        StepResult::Skipped { .. }
    ));
    assert!(matches!(
        second.result("publish-npm").unwrap(),
        StepResult::Failed { .. }
    ));
    assert!(matches!(
        second.result("publish-pypi").unwrap(),
        StepResult::Skipped { .. }
    ));
    assert_eq!(line_count(&root.path().join("npm.log")), 2);
    assert_eq!(line_count(&root.path().join("pypi.log")), 1);
}

// ---------------------------------------------------------------------------
// Graph construction failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
    let root = TempDir::new().unwrap();

    let err = PipelineGraph::build(vec![
        Step::new("a", "echo ran >> a.log", root.path().join("a"))
            .trigger_output("b"),
        Step::new("b", "echo ran >> b.log", root.path().join("b"))
            .trigger_output("a"),
    ])
    .unwrap_err();

    assert!(matches!(err, CascadeError::CycleDetected { .. }));
    assert!(err.is_graph_error());
    // Construction failed, so no command ever executed.
    assert!(!root.path().join("a/a.log").exists());
    assert!(!root.path().join("b/b.log").exists());
}

// ---------------------------------------------------------------------------
// Concurrent invocations over a shared durable store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_runs_execute_each_step_at_most_once() {
    let root = TempDir::new().unwrap();
    let plugin = root.path().join("plugin.bin");
    tokio::fs::write(&plugin, "v1").await.unwrap();

    let build = || {
        PipelineGraph::build(vec![Step::new(
            "generate",
            "echo ran >> ../runs.log",
            root.path().join("work"),
        )
        .trigger_file(&plugin)
        .output_glob("*.out")])
        .unwrap()
    };
    let graph_a = build();
    let graph_b = build();

    // Two executors, two store handles, one shared directory: the per-step
    // lock file is the only thing preventing a double execution.
    let store_a: Arc<dyn RunRecordStore> =
        Arc::new(JsonRecordStore::new(root.path().join("records")));
    let store_b: Arc<dyn RunRecordStore> =
        Arc::new(JsonRecordStore::new(root.path().join("records")));
    let exec_a = executor();
    let exec_b = executor();

    let (ra, rb) = tokio::join!(
        exec_a.run(&graph_a, store_a),
        exec_b.run(&graph_b, store_b)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(line_count(&root.path().join("runs.log")), 1);
    let executed = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r.result("generate").unwrap(), StepResult::Executed { .. }))
        .count();
    let skipped = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r.result("generate").unwrap(), StepResult::Skipped { .. }))
        .count();
    assert_eq!((executed, skipped), (1, 1));
}
