//! Dependencies of a compilation root.
//!
//! A scene (or an external events list) depends on:
//! - the external events and scenes it links to, transitively,
//! - the source files referenced by C++ code events or instruction parameters
//!   anywhere in those event trees.
//!
//! The analysis never caches anything: results are only valid for the project
//! state they were computed from.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::Graph;
use tracing::warn;

use crate::events::{EventKind, EventList, Parameter};
use crate::project::{EntityId, ExternalEventsHandle, Project, SceneHandle};
use crate::{Error, Result};

/// Everything a compilation root needs, by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub source_files: BTreeSet<String>,
    pub external_events: BTreeSet<String>,
    pub scenes: BTreeSet<String>,
    /// External events reached through a link nested in sub events. Those
    /// are inlined in the code of the linking events.
    pub not_top_level_external_events: BTreeSet<String>,
}

/// Root of a dependency analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisRoot {
    Scene(SceneHandle),
    ExternalEvents(ExternalEventsHandle),
}

/// A node of the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyNode {
    Scene(String),
    ExternalEvents(String),
    SourceFile(String),
}

impl fmt::Display for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scene(name) => write!(f, "scene {}", name),
            Self::ExternalEvents(name) => write!(f, "external events {}", name),
            Self::SourceFile(name) => write!(f, "source file {}", name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Unit {
    Scene(EntityId),
    ExternalEvents(EntityId),
}

struct Walk<'a> {
    project: &'a Project,
    deps: DependencySet,
    path: Vec<(Unit, DependencyNode)>,
    /// Units walked so far, with the top-level flag they were walked with.
    visited: HashSet<(Unit, bool)>,
    edges: Vec<(DependencyNode, DependencyNode)>,
    cycle: Option<String>,
}

impl<'a> Walk<'a> {
    fn new(project: &'a Project) -> Self {
        Self {
            project,
            deps: DependencySet::default(),
            path: vec![],
            visited: HashSet::new(),
            edges: vec![],
            cycle: None,
        }
    }

    fn parent(&self) -> Option<DependencyNode> {
        self.path.last().map(|(_, node)| node.clone())
    }

    fn enter(&mut self, unit: Unit, node: DependencyNode, events: &EventList, top_level: bool) {
        if let Some(parent) = self.parent() {
            self.edges.push((node.clone(), parent));
        }

        if let Some(position) = self.path.iter().position(|(u, _)| *u == unit) {
            if self.cycle.is_none() {
                let mut names: Vec<String> = self.path[position..]
                    .iter()
                    .map(|(_, node)| node.to_string())
                    .collect();
                names.push(node.to_string());
                self.cycle = Some(names.join(" -> "));
            }
            return;
        }
        // a unit reached again below top level is walked again: what it
        // links to is no longer top level.
        if !self.visited.insert((unit, top_level)) {
            return;
        }

        self.path.push((unit, node));
        self.walk(events, top_level);
        self.path.pop();
    }

    fn link(&mut self, target: &str, top_level: bool) {
        let project = self.project;
        if let Some((_, external_events)) = project.external_events_named(target) {
            self.deps.external_events.insert(target.to_owned());
            if !top_level {
                self.deps
                    .not_top_level_external_events
                    .insert(target.to_owned());
            }
            self.enter(
                Unit::ExternalEvents(external_events.id()),
                DependencyNode::ExternalEvents(target.to_owned()),
                external_events.events(),
                top_level,
            );
        } else if let Some((_, scene)) = project.scene_named(target) {
            self.deps.scenes.insert(target.to_owned());
            self.enter(
                Unit::Scene(scene.id()),
                DependencyNode::Scene(target.to_owned()),
                scene.events(),
                top_level,
            );
        } else {
            warn!("'{}' is linked to but does not exist, link ignored", target);
        }
    }

    // missing source files are kept: resolving them is up to the caller.
    fn source_file(&mut self, name: &str) {
        if let Some(parent) = self.parent() {
            self.edges
                .push((DependencyNode::SourceFile(name.to_owned()), parent));
        }
        self.deps.source_files.insert(name.to_owned());
    }

    fn walk(&mut self, events: &EventList, top_level: bool) {
        for event in events {
            match &event.kind {
                EventKind::Link { target } => self.link(target, top_level),
                EventKind::CppCode {
                    associated_file,
                    dependent_files,
                } => {
                    for file in associated_file.iter().chain(dependent_files.iter()) {
                        self.source_file(file);
                    }
                }
                EventKind::Standard { sub_events, .. } => {
                    for instruction in event.instructions() {
                        for parameter in &instruction.parameters {
                            match parameter {
                                Parameter::ExternalEvents(name) => self.link(name, top_level),
                                Parameter::SourceFile(name) => self.source_file(name),
                                Parameter::Expression(_) => {}
                            }
                        }
                    }
                    self.walk(sub_events, false);
                }
                EventKind::Comment(_) => {}
            }
        }
    }
}

/// Computes the dependencies of a scene or of an external events list.
pub struct DependenciesAnalyzer<'a> {
    project: &'a Project,
    unit: Unit,
    node: DependencyNode,
    events: &'a EventList,
}

impl<'a> DependenciesAnalyzer<'a> {
    pub fn new(project: &'a Project, root: AnalysisRoot) -> Result<Self> {
        match root {
            AnalysisRoot::Scene(handle) => Self::for_scene(project, handle),
            AnalysisRoot::ExternalEvents(handle) => Self::for_external_events(project, handle),
        }
    }

    pub fn for_scene(project: &'a Project, handle: SceneHandle) -> Result<Self> {
        let scene = project
            .scene(handle)
            .ok_or_else(|| Error::MissingEntity(format!("scene {:?}", handle)))?;
        Ok(Self {
            project,
            unit: Unit::Scene(scene.id()),
            node: DependencyNode::Scene(scene.name().to_owned()),
            events: scene.events(),
        })
    }

    pub fn for_external_events(project: &'a Project, handle: ExternalEventsHandle) -> Result<Self> {
        let external_events = project
            .external_events(handle)
            .ok_or_else(|| Error::MissingEntity(format!("external events {:?}", handle)))?;
        Ok(Self {
            project,
            unit: Unit::ExternalEvents(external_events.id()),
            node: DependencyNode::ExternalEvents(external_events.name().to_owned()),
            events: external_events.events(),
        })
    }

    fn walk(&self) -> Walk<'a> {
        let mut walk = Walk::new(self.project);
        walk.enter(self.unit, self.node.clone(), self.events, true);
        walk
    }

    /// Returns the dependencies of the root, or [`Error::CircularDependency`]
    /// when the root is part of, or leads to, a cycle.
    pub fn analyze(&self) -> Result<DependencySet> {
        let walk = self.walk();
        match walk.cycle {
            Some(cycle) => Err(Error::CircularDependency(cycle)),
            None => Ok(walk.deps),
        }
    }

    /// Name of the only scene the external events can be compiled for.
    ///
    /// External events are compiled standalone only when exactly one scene
    /// uses them, and only through top-level links. `None` otherwise, and
    /// always `None` for a scene root.
    pub fn external_events_can_be_compiled_for_a_scene(&self) -> Option<String> {
        let name = match &self.node {
            DependencyNode::ExternalEvents(name) => name,
            _ => return None,
        };

        let mut owner = None;
        for (handle, scene) in self.project.scenes() {
            let deps = match Self::for_scene(self.project, handle).and_then(|a| a.analyze()) {
                Ok(deps) => deps,
                Err(_) => continue,
            };
            if deps.not_top_level_external_events.contains(name) {
                return None;
            }
            if deps.external_events.contains(name) {
                if owner.is_some() {
                    return None;
                }
                owner = Some(scene.name().to_owned());
            }
        }
        owner
    }

    /// Dependency graph of the root, edges pointing towards dependents.
    ///
    /// Unlike [`Self::analyze`], a cycle does not prevent building the graph.
    pub fn dependency_graph(&self) -> Graph<DependencyNode, ()> {
        let walk = self.walk();

        let mut graph = Graph::new();
        let mut indices = HashMap::<DependencyNode, NodeIndex>::new();
        let mut get_or_create_index = |node: DependencyNode, graph: &mut Graph<_, _>| {
            *indices
                .entry(node.clone())
                .or_insert_with(|| graph.add_node(node))
        };

        get_or_create_index(self.node.clone(), &mut graph);
        for (dependency, dependent) in walk.edges {
            let from = get_or_create_index(dependency, &mut graph);
            let to = get_or_create_index(dependent, &mut graph);
            graph.update_edge(from, to, ());
        }
        graph
    }

    /// Returns the dependency graph in Graphviz DOT format.
    pub fn dependency_graph_dot(&self) -> String {
        let graph = self.dependency_graph();
        let dot = Dot::with_attr_getters(
            &graph,
            &[Config::EdgeNoLabel, Config::NodeNoLabel],
            &|_, _| String::new(),
            &|_, (_, node)| format!("label = \"{}\"", node),
        );
        format!("{:?}", dot)
    }
}

#[cfg(test)]
#[path = "test_analyzer.rs"]
mod test_analyzer;
