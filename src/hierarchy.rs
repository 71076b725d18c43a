//! Hierarchy index - who reports to whom
//!
//! Built once from a list of [`AgentDescriptor`]s and validated as a forest
//! before anything is routed through it. Every parent must sit at a strictly
//! lower level number than its children, which also makes reports-to cycles
//! impossible: an escalation chain always terminates at a root.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::HierarchyError;
use crate::message::AgentId;

/// Hierarchy entry for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    /// 1 is the top of the hierarchy; larger numbers sit lower
    pub level: u32,
    #[serde(default)]
    pub reports_to: Option<AgentId>,
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
}

impl AgentDescriptor {
    /// A level-1 agent
    pub fn root(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            level: 1,
            reports_to: None,
            capability_tags: BTreeSet::new(),
        }
    }

    pub fn reporting(agent_id: impl Into<AgentId>, level: u32, reports_to: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            level,
            reports_to: Some(reports_to.into()),
            capability_tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.reports_to.is_none()
    }
}

/// Read access to the hierarchy used by the escalation policy
pub trait Topology {
    fn descriptor(&self, agent_id: &AgentId) -> Option<&AgentDescriptor>;

    /// Candidate managers of an agent. A validated forest yields at most one.
    fn managers(&self, agent_id: &AgentId) -> Vec<AgentId>;

    /// Agents reporting directly to `agent_id`, sorted by id
    fn direct_reports(&self, agent_id: &AgentId) -> Vec<AgentId>;
}

#[derive(Debug, Clone)]
struct HierarchyNode {
    descriptor: AgentDescriptor,
    children: Vec<AgentId>,
}

/// Validated, read-only map from agent identity to its place in the hierarchy
#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    nodes: HashMap<AgentId, HierarchyNode>,
    roots: Vec<AgentId>,
}

impl HierarchyIndex {
    /// Build and validate an index
    pub fn new(descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Result<Self, HierarchyError> {
        let mut nodes: HashMap<AgentId, HierarchyNode> = HashMap::new();

        for descriptor in descriptors {
            if descriptor.level == 0 {
                return Err(HierarchyError::InvalidLevel(descriptor.agent_id));
            }
            if nodes.contains_key(&descriptor.agent_id) {
                return Err(HierarchyError::DuplicateAgent(descriptor.agent_id));
            }
            nodes.insert(
                descriptor.agent_id.clone(),
                HierarchyNode {
                    descriptor,
                    children: Vec::new(),
                },
            );
        }

        let mut roots = Vec::new();
        let mut edges = Vec::new();

        for node in nodes.values() {
            let d = &node.descriptor;
            match (&d.reports_to, d.level) {
                (None, 1) => roots.push(d.agent_id.clone()),
                (None, level) => {
                    return Err(HierarchyError::MissingManager {
                        agent: d.agent_id.clone(),
                        level,
                    })
                }
                (Some(manager), 1) => {
                    return Err(HierarchyError::RootWithManager {
                        agent: d.agent_id.clone(),
                        manager: manager.clone(),
                    })
                }
                (Some(manager), level) => {
                    let parent = nodes.get(manager).ok_or_else(|| HierarchyError::UnknownManager {
                        agent: d.agent_id.clone(),
                        manager: manager.clone(),
                    })?;
                    if parent.descriptor.level >= level {
                        return Err(HierarchyError::LevelOrder {
                            agent: d.agent_id.clone(),
                            level,
                            manager: manager.clone(),
                            manager_level: parent.descriptor.level,
                        });
                    }
                    edges.push((manager.clone(), d.agent_id.clone()));
                }
            }
        }

        for (manager, agent) in edges {
            if let Some(parent) = nodes.get_mut(&manager) {
                parent.children.push(agent);
            }
        }
        for node in nodes.values_mut() {
            node.children.sort();
        }
        roots.sort();

        Ok(Self { nodes, roots })
    }

    /// Load `[[agents]]` tables from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: HierarchyConfig = toml::from_str(contents)?;
        config.build()
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentDescriptor> {
        self.nodes.get(agent_id).map(|n| &n.descriptor)
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.nodes.contains_key(agent_id)
    }

    /// Get the manager of an agent
    pub fn manager_of(&self, agent_id: &AgentId) -> Option<&AgentId> {
        self.get(agent_id).and_then(|d| d.reports_to.as_ref())
    }

    /// Level-1 agents, sorted by id
    pub fn roots(&self) -> &[AgentId] {
        &self.roots
    }

    /// Number of hops from an agent up to its root
    pub fn depth_below_root(&self, agent_id: &AgentId) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.get(agent_id)?;

        while let Some(manager) = &current.reports_to {
            current = self.get(manager)?;
            depth += 1;
        }

        Some(depth)
    }

    /// All agents at a given level
    pub fn agents_at_level(&self, level: u32) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .nodes
            .values()
            .filter(|n| n.descriptor.level == level)
            .map(|n| n.descriptor.agent_id.clone())
            .collect();
        agents.sort();
        agents
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &AgentId> {
        self.nodes.keys()
    }

    /// Copy of every descriptor, sorted by id
    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        let mut descriptors: Vec<AgentDescriptor> =
            self.nodes.values().map(|n| n.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Topology for HierarchyIndex {
    fn descriptor(&self, agent_id: &AgentId) -> Option<&AgentDescriptor> {
        self.get(agent_id)
    }

    fn managers(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.manager_of(agent_id).cloned().into_iter().collect()
    }

    fn direct_reports(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.nodes
            .get(agent_id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }
}

/// Serialized form of a hierarchy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HierarchyConfig {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl HierarchyConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn build(self) -> Result<HierarchyIndex, ConfigError> {
        Ok(HierarchyIndex::new(self.agents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AgentId {
        AgentId::from(s)
    }

    /// CEO (1) <- B (2) <- {A, C} (3), plus a second lead D (2)
    fn org() -> HierarchyIndex {
        HierarchyIndex::new(vec![
            AgentDescriptor::root("CEO"),
            AgentDescriptor::reporting("B", 2, "CEO").with_tag("itsm"),
            AgentDescriptor::reporting("D", 2, "CEO"),
            AgentDescriptor::reporting("A", 3, "B"),
            AgentDescriptor::reporting("C", 3, "B").with_tag("incident"),
        ])
        .unwrap()
    }

    // === Creation Tests ===

    #[test]
    fn test_hierarchy_creation() {
        let hierarchy = HierarchyIndex::new(Vec::new()).unwrap();
        assert!(hierarchy.is_empty());
        assert!(hierarchy.roots().is_empty());
    }

    #[test]
    fn test_hierarchy_default() {
        let hierarchy: HierarchyIndex = Default::default();
        assert_eq!(hierarchy.len(), 0);
    }

    #[test]
    fn test_org_structure() {
        let hierarchy = org();
        assert_eq!(hierarchy.len(), 5);
        assert_eq!(hierarchy.roots(), &[id("CEO")]);
        assert_eq!(hierarchy.direct_reports(&id("CEO")), vec![id("B"), id("D")]);
        assert_eq!(hierarchy.direct_reports(&id("B")), vec![id("A"), id("C")]);
        assert!(hierarchy.direct_reports(&id("A")).is_empty());
    }

    #[test]
    fn test_capability_tags_kept() {
        let hierarchy = org();
        assert!(hierarchy.get(&id("C")).unwrap().capability_tags.contains("incident"));
    }

    #[test]
    fn test_forest_with_two_roots() {
        let hierarchy = HierarchyIndex::new(vec![
            AgentDescriptor::root("X"),
            AgentDescriptor::root("Y"),
            AgentDescriptor::reporting("x1", 2, "X"),
        ])
        .unwrap();
        assert_eq!(hierarchy.roots(), &[id("X"), id("Y")]);
    }

    // === Validation Tests ===

    #[test]
    fn test_duplicate_agent_rejected() {
        let err = HierarchyIndex::new(vec![AgentDescriptor::root("CEO"), AgentDescriptor::root("CEO")])
            .unwrap_err();
        assert!(matches!(err, HierarchyError::DuplicateAgent(a) if a == id("CEO")));
    }

    #[test]
    fn test_unknown_manager_rejected() {
        let err = HierarchyIndex::new(vec![AgentDescriptor::reporting("A", 2, "ghost")]).unwrap_err();
        assert!(matches!(err, HierarchyError::UnknownManager { .. }));
    }

    #[test]
    fn test_root_with_manager_rejected() {
        let err = HierarchyIndex::new(vec![
            AgentDescriptor::root("CEO"),
            AgentDescriptor::reporting("B", 1, "CEO"),
        ])
        .unwrap_err();
        assert!(matches!(err, HierarchyError::RootWithManager { .. }));
    }

    #[test]
    fn test_missing_manager_rejected() {
        let mut orphan = AgentDescriptor::root("A");
        orphan.level = 3;
        let err = HierarchyIndex::new(vec![orphan]).unwrap_err();
        assert!(matches!(err, HierarchyError::MissingManager { level: 3, .. }));
    }

    #[test]
    fn test_level_zero_rejected() {
        let mut bad = AgentDescriptor::root("A");
        bad.level = 0;
        assert!(matches!(
            HierarchyIndex::new(vec![bad]),
            Err(HierarchyError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_by_level_order() {
        // X -> Y -> X can only be expressed by breaking the level rule
        let err = HierarchyIndex::new(vec![
            AgentDescriptor::root("CEO"),
            AgentDescriptor::reporting("X", 2, "Y"),
            AgentDescriptor::reporting("Y", 2, "X"),
        ])
        .unwrap_err();
        assert!(matches!(err, HierarchyError::LevelOrder { .. }));
    }

    // === Depth Tests ===

    #[test]
    fn test_depth_below_root() {
        let hierarchy = org();
        assert_eq!(hierarchy.depth_below_root(&id("CEO")), Some(0));
        assert_eq!(hierarchy.depth_below_root(&id("B")), Some(1));
        assert_eq!(hierarchy.depth_below_root(&id("C")), Some(2));
        assert_eq!(hierarchy.depth_below_root(&id("nobody")), None);
    }

    #[test]
    fn test_agents_at_level() {
        let hierarchy = org();
        assert_eq!(hierarchy.agents_at_level(1), vec![id("CEO")]);
        assert_eq!(hierarchy.agents_at_level(2), vec![id("B"), id("D")]);
        assert_eq!(hierarchy.agents_at_level(3), vec![id("A"), id("C")]);
        assert!(hierarchy.agents_at_level(5).is_empty());
    }

    // === Parent Tests ===

    #[test]
    fn test_manager_of() {
        let hierarchy = org();
        assert!(hierarchy.manager_of(&id("CEO")).is_none());
        assert_eq!(hierarchy.manager_of(&id("C")), Some(&id("B")));
        assert_eq!(hierarchy.managers(&id("C")), vec![id("B")]);
        assert!(hierarchy.manager_of(&id("nobody")).is_none());
    }

    #[test]
    fn test_snapshot_sorted() {
        let ids: Vec<AgentId> = org().snapshot().into_iter().map(|d| d.agent_id).collect();
        assert_eq!(ids, vec![id("A"), id("B"), id("C"), id("CEO"), id("D")]);
    }

    // === Loading Tests ===

    #[test]
    fn test_from_toml() {
        let hierarchy = HierarchyIndex::from_toml_str(
            r#"
            [[agents]]
            agent_id = "CEO"
            level = 1

            [[agents]]
            agent_id = "B"
            level = 2
            reports_to = "CEO"
            capability_tags = ["itsm"]
            "#,
        )
        .unwrap();

        assert_eq!(hierarchy.len(), 2);
        assert_eq!(hierarchy.manager_of(&id("B")), Some(&id("CEO")));
    }

    #[test]
    fn test_from_toml_invalid_forest() {
        let err = HierarchyIndex::from_toml_str(
            r#"
            [[agents]]
            agent_id = "B"
            level = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Hierarchy(_)));
    }
}
