//! Dead-code verdicts as written by a full pipeline run.

mod common;

use common::{graph_of, TestRepo};
use meridian::graph::{KnowledgeGraph, NodeId};
use meridian::pipeline::GlobalMode;

const SHAPES: &str = "\
class Base
  def run(self)
  def stop(self)
class Derived(Base)
  def run(self)
  def stop(self)
def main()
  call Base.run
";

const JOBS: &str = "\
interface Runner
  def execute(self)
class Job
  implements Runner
  def execute(self)
class Duck
  def execute(self)
  def quack(self)
";

const WEB: &str = "\
@app.route(\"/\")
def index()
export def public_api()
def test_index()
def unused_helper()
class Model
  def __init__(self)
";

fn verdict(graph: &KnowledgeGraph, id: &str) -> (bool, String) {
    let node = graph.node(&NodeId::from_raw(id)).unwrap();
    (
        node.prop_bool("is_dead"),
        node.prop_str("dead_reason").unwrap_or_default().to_string(),
    )
}

fn analyzed(files: &[(&str, &str)]) -> (TestRepo, KnowledgeGraph) {
    let repo = TestRepo::new(files);
    let pipeline = repo.pipeline();
    pipeline.run_full();
    let graph = graph_of(&pipeline);
    (repo, graph)
}

#[test]
fn test_override_of_live_method_is_kept() {
    let (_repo, graph) = analyzed(&[("shapes.py", SHAPES)]);

    assert_eq!(verdict(&graph, "method:shapes.py:Base.run"), (false, "called".into()));
    assert_eq!(verdict(&graph, "method:shapes.py:Derived.run"), (false, "override".into()));
    // Neither stop is called: an override of a dead method stays dead
    assert_eq!(verdict(&graph, "method:shapes.py:Base.stop"), (true, "unreferenced".into()));
    assert_eq!(verdict(&graph, "method:shapes.py:Derived.stop"), (true, "unreferenced".into()));
}

#[test]
fn test_base_method_stays_dead_when_only_override_is_called() {
    let source = "\
class Base
  def run(self)
class Derived(Base)
  def run(self)
def main()
  call Derived.run
";
    let (_repo, graph) = analyzed(&[("shapes.py", source)]);
    assert_eq!(verdict(&graph, "method:shapes.py:Derived.run"), (false, "called".into()));
    assert_eq!(verdict(&graph, "method:shapes.py:Base.run"), (true, "unreferenced".into()));
}

#[test]
fn test_protocol_methods_are_exempt() {
    let (_repo, graph) = analyzed(&[("jobs.py", JOBS)]);

    assert_eq!(verdict(&graph, "method:jobs.py:Runner.execute"), (false, "protocol_stub".into()));
    assert_eq!(
        verdict(&graph, "method:jobs.py:Job.execute"),
        (false, "protocol_conformance".into())
    );
    // Duck conforms structurally, so execute is exempt but quack is not
    assert_eq!(
        verdict(&graph, "method:jobs.py:Duck.execute"),
        (false, "protocol_conformance".into())
    );
    assert_eq!(verdict(&graph, "method:jobs.py:Duck.quack"), (true, "unreferenced".into()));
}

#[test]
fn test_registry_exemptions() {
    let (_repo, graph) = analyzed(&[("web.py", WEB)]);

    assert_eq!(verdict(&graph, "function:web.py:index"), (false, "entry_point".into()));
    assert_eq!(verdict(&graph, "function:web.py:public_api"), (false, "exported".into()));
    assert_eq!(verdict(&graph, "function:web.py:test_index"), (false, "test".into()));
    assert_eq!(verdict(&graph, "method:web.py:Model.__init__"), (false, "constructor".into()));
    assert_eq!(verdict(&graph, "function:web.py:unused_helper"), (true, "unreferenced".into()));
}

#[test]
fn test_verdicts_recomputed_after_change() {
    let repo = TestRepo::new(&[("web.py", WEB)]);
    let pipeline = repo.pipeline();
    pipeline.run_full();
    assert!(verdict(&graph_of(&pipeline), "function:web.py:unused_helper").0);

    repo.write("cli.py", "from web import unused_helper\ndef main()\n  call unused_helper\n");
    pipeline.run_incremental(&["cli.py".to_string()], GlobalMode::Immediate);
    assert_eq!(
        verdict(&graph_of(&pipeline), "function:web.py:unused_helper"),
        (false, "called".into())
    );

    repo.remove("cli.py");
    pipeline.run_incremental(&["cli.py".to_string()], GlobalMode::Immediate);
    assert!(verdict(&graph_of(&pipeline), "function:web.py:unused_helper").0);
}

#[test]
fn test_deferred_run_leaves_verdicts_until_global_refresh() {
    let repo = TestRepo::new(&[("web.py", WEB)]);
    let pipeline = repo.pipeline();
    pipeline.run_full();

    repo.write("cli.py", "from web import unused_helper\ndef main()\n  call unused_helper\n");
    pipeline.run_incremental(&["cli.py".to_string()], GlobalMode::Deferred);
    assert!(verdict(&graph_of(&pipeline), "function:web.py:unused_helper").0);

    pipeline.run_global();
    assert!(!verdict(&graph_of(&pipeline), "function:web.py:unused_helper").0);
}

#[test]
fn test_self_recursive_function_is_unreferenced() {
    let source = "\
def walk(node)
  call walk
def visit()
  call visit
def main()
  call visit
";
    let (_repo, graph) = analyzed(&[("tree.py", source)]);
    assert_eq!(verdict(&graph, "function:tree.py:walk"), (true, "unreferenced".into()));
    assert_eq!(verdict(&graph, "function:tree.py:visit"), (false, "called".into()));
}
