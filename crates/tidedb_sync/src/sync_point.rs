//! A sync point: the set of views at one path.
//!
//! Exists only while at least one view exists at the path; the sync tree
//! removes it when the last registration goes away.

use crate::events::{EventRegistration, RaisedEvent};
use crate::operation::Operation;
use crate::view::{CacheNode, View, ViewApplyResult};
use crate::write_tree::WriteTree;
use std::collections::HashMap;
use tidedb_core::{QueryParams, QuerySpec};

/// Views at one path, keyed by query parameters.
#[derive(Default)]
pub struct SyncPoint {
    views: HashMap<QueryParams, View>,
}

impl SyncPoint {
    /// An empty sync point.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no views remain.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// The view for exact parameters, if present.
    pub fn view_for(&self, params: &QueryParams) -> Option<&View> {
        self.views.get(params)
    }

    /// All views at this point.
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// A view whose window covers all data at this path, if any. Such a
    /// view can serve every narrower query here and below.
    pub fn complete_view(&self) -> Option<&View> {
        // Prefer the plain default view over an indexed loads-all view.
        self.views
            .get(&QueryParams::default())
            .or_else(|| self.views.values().find(|v| v.query().loads_all_data()))
    }

    /// True when some view here covers all data at this path.
    pub fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    /// A complete server-cache value at this path, if any view has one.
    pub fn complete_server_cache(&self) -> Option<&CacheNode> {
        self.views
            .values()
            .filter(|v| v.query().loads_all_data())
            .map(|v| v.server_cache())
            .find(|cache| cache.complete)
    }

    /// Applies an operation to the matching views.
    ///
    /// A tagged operation targets exactly the view with `target` parameters;
    /// untagged operations fan out to every view here. Each result is paired
    /// with its view's query so the caller can report tracked-key deltas.
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        writes: &WriteTree,
        target: Option<&QueryParams>,
    ) -> Vec<(QuerySpec, ViewApplyResult)> {
        match target {
            Some(params) => match self.views.get_mut(params) {
                Some(view) => {
                    let query = view.query().clone();
                    vec![(query, view.apply_operation(op, writes))]
                }
                None => Vec::new(),
            },
            None => self
                .views
                .values_mut()
                .map(|view| {
                    let query = view.query().clone();
                    (query, view.apply_operation(op, writes))
                })
                .collect(),
        }
    }

    /// Attaches a registration, creating the view on first use.
    ///
    /// Returns the initial events and whether the view is new (a new view
    /// for an unshadowed query needs a listen).
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
        initial_server: CacheNode,
        writes: &WriteTree,
    ) -> (Vec<RaisedEvent>, bool) {
        let mut created = false;
        let view = self.views.entry(query.params.clone()).or_insert_with(|| {
            created = true;
            View::new(query.clone(), initial_server, writes)
        });
        (view.add_registration(registration), created)
    }

    /// Detaches a registration (all of them when `id` is `None`).
    ///
    /// Returns the removed registrations plus the queries whose views died
    /// and therefore need their listens stopped.
    pub fn remove_event_registration(
        &mut self,
        params: &QueryParams,
        id: Option<u64>,
    ) -> (Vec<EventRegistration>, Vec<QuerySpec>) {
        let Some(view) = self.views.get_mut(params) else {
            return (Vec::new(), Vec::new());
        };
        let removed = view.remove_registration(id);
        let mut dead = Vec::new();
        if view.is_empty() {
            dead.push(view.query().clone());
            self.views.remove(params);
        }
        (removed, dead)
    }

    /// Removes every view, returning each view's registrations with its
    /// query. Used when a listen is revoked or the engine shuts down.
    pub fn remove_all_views(&mut self) -> Vec<(QuerySpec, Vec<EventRegistration>)> {
        self.views
            .drain()
            .map(|(_, mut view)| {
                let regs = view.remove_registration(None);
                (view.query().clone(), regs)
            })
            .collect()
    }

    /// The queries of all views at this point.
    pub fn queries(&self) -> Vec<QuerySpec> {
        self.views.values().map(|v| v.query().clone()).collect()
    }
}
