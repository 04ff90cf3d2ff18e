//! Name index over an agent hierarchy.
//!
//! Built once per Runner. Parent links are `Weak` and used for lookup only;
//! ownership stays with each agent's `sub_agents`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::agent::Agent;

struct Node {
    agent: Arc<dyn Agent>,
    parent: Option<Weak<dyn Agent>>,
}

pub struct AgentTree {
    root: Arc<dyn Agent>,
    index: HashMap<String, Node>,
    duplicates: HashSet<String>,
    agents: Vec<Arc<dyn Agent>>,
}

impl AgentTree {
    pub fn new(root: Arc<dyn Agent>) -> Self {
        let mut tree = Self {
            root: Arc::clone(&root),
            index: HashMap::new(),
            duplicates: HashSet::new(),
            agents: Vec::new(),
        };
        tree.visit(root, None);
        for name in &tree.duplicates {
            warn!(agent = %name, "agent name is not unique in the tree; it will not be routed to");
        }
        tree
    }

    fn visit(&mut self, agent: Arc<dyn Agent>, parent: Option<Weak<dyn Agent>>) {
        let name = agent.name().to_string();
        if self.index.contains_key(&name) {
            self.duplicates.insert(name.clone());
        } else {
            self.index.insert(
                name,
                Node {
                    agent: Arc::clone(&agent),
                    parent,
                },
            );
        }
        self.agents.push(Arc::clone(&agent));

        let link = Arc::downgrade(&agent);
        for sub in agent.sub_agents() {
            self.visit(Arc::clone(sub), Some(link.clone()));
        }
    }

    pub fn root(&self) -> &Arc<dyn Agent> {
        &self.root
    }

    /// Agent with this name, unless the name is unknown or ambiguous.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Agent>> {
        if self.duplicates.contains(name) {
            return None;
        }
        self.index.get(name).map(|node| Arc::clone(&node.agent))
    }

    pub fn parent_of(&self, name: &str) -> Option<Arc<dyn Agent>> {
        if self.duplicates.contains(name) {
            return None;
        }
        self.index
            .get(name)
            .and_then(|node| node.parent.as_ref())
            .and_then(Weak::upgrade)
    }

    /// True when a conversation may stay with `name` on the next turn: the
    /// agent resolves, and it and every ancestor below the root allow
    /// transfer to their parent.
    pub fn is_reenterable(&self, name: &str) -> bool {
        let Some(mut current) = self.resolve(name) else {
            return false;
        };
        loop {
            if current.name() == self.root.name() {
                return true;
            }
            if !current.allows_transfer_to_parent() {
                return false;
            }
            match self.parent_of(current.name()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Every agent in depth-first order, duplicates included.
    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
