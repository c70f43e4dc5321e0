//! Relations between software objects and the rest of the system.

/// Forward/reverse relation names.
pub mod kind {
    pub const ACTIVE_FWD: &str = "active";
    pub const ACTIVE_REV: &str = "software_version";
    pub const FUNCTIONAL_FWD: &str = "functional";
    pub const FUNCTIONAL_REV: &str = "software_version";
    pub const UPDATEABLE_FWD: &str = "updateable";
    pub const UPDATEABLE_REV: &str = "software_version";
    pub const ACTIVATION_FWD: &str = "inventory";
    pub const ACTIVATION_REV: &str = "activation";
}

/// One `(forward, reverse, target)` relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association {
    pub forward: String,
    pub reverse: String,
    pub path: String,
}

impl Association {
    pub fn new(forward: &str, reverse: &str, path: impl Into<String>) -> Self {
        Self {
            forward: forward.to_string(),
            reverse: reverse.to_string(),
            path: path.into(),
        }
    }

    pub fn active(path: &str) -> Self {
        Self::new(kind::ACTIVE_FWD, kind::ACTIVE_REV, path)
    }

    pub fn functional(path: &str) -> Self {
        Self::new(kind::FUNCTIONAL_FWD, kind::FUNCTIONAL_REV, path)
    }

    pub fn updateable(path: &str) -> Self {
        Self::new(kind::UPDATEABLE_FWD, kind::UPDATEABLE_REV, path)
    }

    pub fn inventory(inventory_path: &str) -> Self {
        Self::new(kind::ACTIVATION_FWD, kind::ACTIVATION_REV, inventory_path)
    }
}

/// Live, ordered set of relations published by the updater.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationSet {
    entries: Vec<Association>,
}

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relation unless an identical one is already present.
    pub fn add(&mut self, association: Association) {
        if !self.entries.contains(&association) {
            self.entries.push(association);
        }
    }

    /// Remove every relation targeting `path`; returns how many were removed.
    pub fn remove_path(&mut self, path: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|a| a.path != path);
        before - self.entries.len()
    }

    pub fn contains(&self, forward: &str, path: &str) -> bool {
        self.entries
            .iter()
            .any(|a| a.forward == forward && a.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Association> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
