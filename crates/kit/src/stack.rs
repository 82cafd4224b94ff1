//! Declarative multi-VM stacks: a YAML file of project-config-shaped
//! entries plus `depends_on` edges, reconciled through the lifecycle
//! engine.
//!
//! Deploy walks the dependency graph with a small worker pool; a dependent
//! starts once its dependency is Running (or Ready, when the dependency
//! sets `wait_ready: true`). A node failure marks its transitive
//! dependents Skipped; nodes already started stay running and the partial
//! result is reported, not rolled back.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Condvar, Mutex};

use color_eyre::Result;
use yaml_rust2::{Yaml, YamlLoader};

use crate::config::GlobalConfig;
use crate::errors::Error;
use crate::project::ProjectConfig;
use crate::spec::{self, Overrides, VmSpec};
use crate::vm::Engine;

const MAX_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct StackNode {
    pub spec: VmSpec,
    pub depends_on: Vec<String>,
    /// Dependents of this node wait for Ready instead of Running.
    pub wait_ready: bool,
}

#[derive(Debug, Clone)]
pub struct StackDecl {
    /// Nodes in declaration order; `order` holds a topological ordering of
    /// indices into it.
    pub nodes: Vec<StackNode>,
    order: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    /// Started, but the readiness probe timed out.
    Running,
    Failed(String),
    Skipped,
    Destroyed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "Ready"),
            NodeStatus::Running => write!(f, "Running"),
            NodeStatus::Failed(kind) => write!(f, "Failed({kind})"),
            NodeStatus::Skipped => write!(f, "Skipped"),
            NodeStatus::Destroyed => write!(f, "Destroyed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackReport {
    /// Per-node status in topological order.
    pub statuses: Vec<(String, NodeStatus)>,
}

impl StackReport {
    #[allow(dead_code)]
    pub fn status_of(&self, name: &str) -> Option<&NodeStatus> {
        self.statuses
            .iter()
            .find_map(|(n, s)| (n == name).then_some(s))
    }

    /// Deploy succeeded only when every node is Ready.
    pub fn all_ready(&self) -> bool {
        self.statuses
            .iter()
            .all(|(_, s)| matches!(s, NodeStatus::Ready))
    }

    pub fn render(&self) -> String {
        let width = self
            .statuses
            .iter()
            .map(|(n, _)| n.len())
            .max()
            .unwrap_or(4)
            .max(4);
        let mut out = format!("{:<width$}  STATUS\n", "NAME");
        for (name, status) in &self.statuses {
            out.push_str(&format!("{name:<width$}  {status}\n"));
        }
        out
    }
}

/// Parse and validate a stack declaration, resolving each entry against
/// the image catalog.
pub fn load(path: &Path, global: &GlobalConfig) -> Result<StackDecl> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
        message: format!("reading stack file {}: {e}", path.display()),
    })?;
    parse(&text, global)
}

pub fn parse(text: &str, global: &GlobalConfig) -> Result<StackDecl> {
    let docs = YamlLoader::load_from_str(text).map_err(|e| Error::ConfigInvalid {
        message: format!("stack file is not valid YAML: {e}"),
    })?;
    let doc = docs.first().ok_or_else(|| Error::ConfigInvalid {
        message: "stack file is empty".to_string(),
    })?;

    let entries = doc["vms"].as_vec().ok_or_else(|| Error::ConfigInvalid {
        message: "stack file needs a top-level `vms` list".to_string(),
    })?;
    parse_entries(entries, global)
}

fn parse_entries(entries: &[Yaml], global: &GlobalConfig) -> Result<StackDecl> {
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let hash = entry.as_hash().ok_or_else(|| Error::ConfigInvalid {
            message: "each `vms` entry must be a mapping".to_string(),
        })?;

        let mut values = BTreeMap::new();
        let mut depends_on = Vec::new();
        let mut wait_ready = false;
        for (k, v) in hash {
            let key = k.as_str().ok_or_else(|| Error::ConfigInvalid {
                message: "non-string key in stack entry".to_string(),
            })?;
            match key {
                "depends_on" => {
                    let deps = v.as_vec().ok_or_else(|| Error::ConfigInvalid {
                        message: "`depends_on` must be a list of names".to_string(),
                    })?;
                    for dep in deps {
                        depends_on.push(
                            dep.as_str()
                                .ok_or_else(|| Error::ConfigInvalid {
                                    message: "`depends_on` entries must be names".to_string(),
                                })?
                                .to_string(),
                        );
                    }
                }
                "wait_ready" => {
                    wait_ready = v.as_bool().ok_or_else(|| Error::ConfigInvalid {
                        message: "`wait_ready` must be a boolean".to_string(),
                    })?;
                }
                _ => {
                    values.insert(key.to_string(), scalar_to_string(key, v)?);
                }
            }
        }

        let project = ProjectConfig {
            values,
            dir: std::path::PathBuf::new(),
        };
        let spec = spec::resolve(global, Some(&project), &Overrides::default())?;
        nodes.push(StackNode {
            spec,
            depends_on,
            wait_ready,
        });
    }

    let order = topo_order(&nodes)?;
    Ok(StackDecl { nodes, order })
}

fn scalar_to_string(key: &str, v: &Yaml) -> Result<String> {
    match v {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Real(r) => Ok(r.clone()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        _ => Err(Error::ConfigInvalid {
            message: format!("stack entry key `{key}` must be a scalar"),
        }
        .into()),
    }
}

/// Kahn's algorithm; also rejects duplicate names, unknown dependencies
/// and self-edges.
fn topo_order(nodes: &[StackNode]) -> Result<Vec<usize>> {
    let mut index_of = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if index_of.insert(node.spec.name.clone(), i).is_some() {
            return Err(Error::ConfigInvalid {
                message: format!("duplicate stack node name '{}'", node.spec.name),
            }
            .into());
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            let Some(&j) = index_of.get(dep) else {
                return Err(Error::ConfigInvalid {
                    message: format!(
                        "node '{}' depends on unknown node '{dep}'",
                        node.spec.name
                    ),
                }
                .into());
            };
            if j == i {
                return Err(Error::ConfigInvalid {
                    message: format!("node '{}' depends on itself", node.spec.name),
                }
                .into());
            }
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(Error::ConfigInvalid {
            message: "stack dependencies form a cycle".to_string(),
        }
        .into());
    }
    Ok(order)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Ready,
    Failed,
    Skipped,
}

struct DeployState {
    phases: Mutex<HashMap<String, Phase>>,
    changed: Condvar,
    pool: Mutex<usize>,
    pool_free: Condvar,
}

impl DeployState {
    fn set(&self, name: &str, phase: Phase) {
        self.phases.lock().unwrap().insert(name.to_string(), phase);
        self.changed.notify_all();
    }

    /// Block until every dependency is satisfied; Err(()) means a
    /// dependency failed or was skipped and this node must be skipped.
    fn await_deps(&self, node: &StackNode, by_name: &HashMap<String, &StackNode>) -> std::result::Result<(), ()> {
        let mut phases = self.phases.lock().unwrap();
        loop {
            let mut satisfied = true;
            for dep in &node.depends_on {
                let dep_wait_ready = by_name.get(dep.as_str()).map(|n| n.wait_ready).unwrap_or(false);
                match phases.get(dep.as_str()).unwrap_or(&Phase::Waiting) {
                    Phase::Failed | Phase::Skipped => return Err(()),
                    Phase::Ready => {}
                    Phase::Running if !dep_wait_ready => {}
                    _ => satisfied = false,
                }
            }
            if satisfied {
                return Ok(());
            }
            phases = self.changed.wait(phases).unwrap();
        }
    }

    fn acquire(&self) {
        let mut permits = self.pool.lock().unwrap();
        while *permits == 0 {
            permits = self.pool_free.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    fn release(&self) {
        *self.pool.lock().unwrap() += 1;
        self.pool_free.notify_one();
    }
}

/// Deploy the stack. Independent nodes run in parallel on a pool of
/// `min(4, |independent set|)` workers; readiness probing happens outside
/// the pool so a slow boot does not starve unrelated nodes.
pub fn deploy(engine: &Engine, global: &GlobalConfig, decl: &StackDecl) -> StackReport {
    let independent = decl
        .nodes
        .iter()
        .filter(|n| n.depends_on.is_empty())
        .count();
    let workers = independent.clamp(1, MAX_WORKERS);

    let state = DeployState {
        phases: Mutex::new(HashMap::new()),
        changed: Condvar::new(),
        pool: Mutex::new(workers),
        pool_free: Condvar::new(),
    };
    let by_name: HashMap<String, &StackNode> = decl
        .nodes
        .iter()
        .map(|n| (n.spec.name.clone(), n))
        .collect();

    let results: Mutex<HashMap<String, NodeStatus>> = Mutex::new(HashMap::new());

    std::thread::scope(|scope| {
        for node in &decl.nodes {
            let state = &state;
            let by_name = &by_name;
            let results = &results;
            scope.spawn(move || {
                let name = node.spec.name.clone();
                if state.await_deps(node, by_name).is_err() {
                    tracing::warn!(%name, "skipped: dependency failed");
                    state.set(&name, Phase::Skipped);
                    results.lock().unwrap().insert(name, NodeStatus::Skipped);
                    return;
                }

                state.acquire();
                let started = engine.up_start(global, &node.spec, None);
                state.release();

                let started = match started {
                    Ok(started) => started,
                    Err(err) => {
                        let kind = kind_of(&err);
                        tracing::error!(%name, %err, "node failed to start");
                        state.set(&name, Phase::Failed);
                        results
                            .lock()
                            .unwrap()
                            .insert(name, NodeStatus::Failed(kind));
                        return;
                    }
                };
                state.set(&name, Phase::Running);

                match engine.probe_ready(&started.lv, &node.spec) {
                    Ok(_) => {
                        state.set(&name, Phase::Ready);
                        results.lock().unwrap().insert(name, NodeStatus::Ready);
                    }
                    Err(err) => {
                        // Timeouts leave the node running; that still
                        // releases dependents that only wait for Running.
                        tracing::warn!(%name, %err, "node started but not ready");
                        results.lock().unwrap().insert(name, NodeStatus::Running);
                    }
                }
            });
        }
    });

    let results = results.into_inner().unwrap();
    StackReport {
        statuses: decl
            .order
            .iter()
            .map(|&i| {
                let name = decl.nodes[i].spec.name.clone();
                let status = results
                    .get(&name)
                    .cloned()
                    .unwrap_or(NodeStatus::Skipped);
                (name, status)
            })
            .collect(),
    }
}

/// Tear the stack down in reverse topological order.
pub fn destroy(engine: &Engine, decl: &StackDecl) -> StackReport {
    let mut statuses = Vec::with_capacity(decl.nodes.len());
    for &i in decl.order.iter().rev() {
        let name = decl.nodes[i].spec.name.clone();
        match engine.down(&name) {
            Ok(()) => statuses.push((name, NodeStatus::Destroyed)),
            Err(err) => {
                tracing::error!(%name, %err, "failed to destroy node");
                statuses.push((name, NodeStatus::Failed(kind_of(&err))));
            }
        }
    }
    StackReport { statuses }
}

fn kind_of(report: &color_eyre::Report) -> String {
    report
        .downcast_ref::<Error>()
        .map(|e| e.kind().to_string())
        .unwrap_or_else(|| "Internal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::StubFetcher;
    use crate::cancel::CancelToken;
    use crate::env::Environment;
    use crate::vm::testing::{http_server, FakeHost};
    use std::sync::Arc;
    use std::time::Duration;

    fn stack_yaml(port: u16) -> String {
        format!(
            "\
vms:
  - name: db
    domain: db.local
    image: postgres:16
    port: {port}
  - name: api
    domain: api.local
    image: api:latest
    port: {port}
    depends_on: [db]
  - name: web
    domain: web.local
    image: web:latest
    port: {port}
    depends_on: [api]
"
        )
    }

    #[test]
    fn parse_resolves_specs_and_orders_topologically() {
        let decl = parse(&stack_yaml(8000), &GlobalConfig::default_catalog()).unwrap();
        assert_eq!(decl.nodes.len(), 3);
        let order: Vec<&str> = decl
            .order
            .iter()
            .map(|&i| decl.nodes[i].spec.name.as_str())
            .collect();
        assert_eq!(order, vec!["db", "api", "web"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = parse(
            "vms:\n  - name: a\n    domain: a.local\n    image: x\n  - name: a\n    domain: b.local\n    image: y\n",
            &GlobalConfig::default_catalog(),
        )
        .unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 2);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = parse(
            "vms:\n  - name: a\n    domain: a.local\n    image: x\n    depends_on: [ghost]\n",
            &GlobalConfig::default_catalog(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycles_rejected() {
        let err = parse(
            "vms:\n  - name: a\n    domain: a.local\n    image: x\n    depends_on: [b]\n  - name: b\n    domain: b.local\n    image: y\n    depends_on: [a]\n",
            &GlobalConfig::default_catalog(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    fn engine_for(dir: &tempfile::TempDir, host: &Arc<FakeHost>, fetcher: Arc<StubFetcher>) -> Engine {
        Engine::new(
            Environment::at(dir.path()),
            host.runner(),
            fetcher,
            CancelToken::new(),
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[test]
    fn deploy_brings_all_nodes_ready_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let engine = engine_for(&dir, &host, Arc::new(StubFetcher::new()));
        let global = GlobalConfig::default_catalog();
        let decl = parse(&stack_yaml(port), &global).unwrap();

        let report = deploy(&engine, &global, &decl);
        assert!(report.all_ready(), "{}", report.render());
        assert!(host.is_defined("db") && host.is_defined("api") && host.is_defined("web"));
    }

    #[test]
    fn failure_skips_transitive_dependents_and_keeps_started_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let global = GlobalConfig::default_catalog();

        // `api` resolves to the fedora image; its download fails, while the
        // default ubuntu image (db, web) downloads fine.
        let yaml = format!(
            "\
vms:
  - name: db
    domain: db.local
    image: postgres:16
    port: {port}
  - name: api
    domain: api.local
    image: api:latest
    port: {port}
    os: fedora38
    depends_on: [db]
  - name: web
    domain: web.local
    image: web:latest
    port: {port}
    depends_on: [api]
"
        );
        let decl = parse(&yaml, &global).unwrap();

        struct SelectiveFetcher(StubFetcher);
        impl crate::cache::Fetcher for SelectiveFetcher {
            fn fetch(&self, url: &str, dest: &std::path::Path) -> color_eyre::Result<()> {
                if url.contains("Fedora") {
                    return Err(crate::errors::Error::ImageFetch {
                        url: url.to_string(),
                        message: "stubbed network failure".into(),
                    }
                    .into());
                }
                self.0.fetch(url, dest)
            }
        }

        let engine = Engine::new(
            Environment::at(dir.path()),
            host.runner(),
            Arc::new(SelectiveFetcher(StubFetcher::new())),
            CancelToken::new(),
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5));

        let report = deploy(&engine, &global, &decl);
        assert_eq!(report.status_of("db"), Some(&NodeStatus::Ready));
        assert_eq!(
            report.status_of("api"),
            Some(&NodeStatus::Failed("ImageFetch".into()))
        );
        assert_eq!(report.status_of("web"), Some(&NodeStatus::Skipped));
        assert!(!report.all_ready());

        assert!(host.is_defined("db"), "db must not be rolled back");
        assert!(!host.is_defined("api"));
        assert!(!host.is_defined("web"));
    }

    #[test]
    fn destroy_reverses_order() {
        let dir = tempfile::tempdir().unwrap();
        let port = http_server();
        let host = FakeHost::new("127.0.0.1");
        let engine = engine_for(&dir, &host, Arc::new(StubFetcher::new()));
        let global = GlobalConfig::default_catalog();
        let decl = parse(&stack_yaml(port), &global).unwrap();
        deploy(&engine, &global, &decl);

        let report = destroy(&engine, &decl);
        let names: Vec<&str> = report.statuses.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["web", "api", "db"]);
        assert!(report
            .statuses
            .iter()
            .all(|(_, s)| *s == NodeStatus::Destroyed));
        assert!(!host.is_defined("db"));
    }

    #[test]
    fn report_renders_a_table() {
        let report = StackReport {
            statuses: vec![
                ("db".into(), NodeStatus::Ready),
                ("api".into(), NodeStatus::Failed("ImageFetch".into())),
                ("web".into(), NodeStatus::Skipped),
            ],
        };
        let table = report.render();
        assert!(table.contains("NAME"));
        assert!(table.contains("Failed(ImageFetch)"));
        assert!(table.contains("Skipped"));
    }
}
