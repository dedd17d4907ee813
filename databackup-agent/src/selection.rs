//! Selection state for a session.
//!
//! Every mutation is checked against the catalog so the selection can never
//! reference an identifier the catalog does not contain. Selection order is
//! preserved: the manifest executes entries first-selected-first.

use crate::catalog::Catalog;
use crate::utils::errors::{Result, SessionError};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    order: Vec<String>,
    selected: HashSet<String>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the selection with every catalog entry flagged as preselected
    pub fn preseeded(catalog: &Catalog) -> Self {
        let mut selection = Self::new();
        for entry in catalog.iter().filter(|e| e.preselected) {
            selection.insert(&entry.id);
        }
        selection
    }

    pub fn select(&mut self, catalog: &Catalog, id: &str) -> Result<()> {
        ensure_known(catalog, id)?;
        self.insert(id);
        Ok(())
    }

    pub fn deselect(&mut self, catalog: &Catalog, id: &str) -> Result<()> {
        ensure_known(catalog, id)?;
        self.remove(id);
        Ok(())
    }

    /// Flip the selection of `id`; returns the new state
    pub fn toggle(&mut self, catalog: &Catalog, id: &str) -> Result<bool> {
        ensure_known(catalog, id)?;
        if self.selected.contains(id) {
            self.remove(id);
            Ok(false)
        } else {
            self.insert(id);
            Ok(true)
        }
    }

    /// Select every catalog entry not already selected, in catalog order
    pub fn select_all(&mut self, catalog: &Catalog) {
        for id in catalog.ids() {
            self.insert(id);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.selected.clear();
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }

    /// Selected identifiers in selection order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn insert(&mut self, id: &str) {
        if self.selected.insert(id.to_string()) {
            self.order.push(id.to_string());
        }
    }

    fn remove(&mut self, id: &str) {
        if self.selected.remove(id) {
            self.order.retain(|selected| selected != id);
        }
    }
}

fn ensure_known(catalog: &Catalog, id: &str) -> Result<()> {
    if catalog.contains(id) {
        Ok(())
    } else {
        Err(SessionError::UnknownEntry(id.to_string()))
    }
}
