use std::{collections::BTreeSet, sync::Arc};

use crate::{key, queue::WaitQueue, registry::BindingRegistry};

/// Turns a `(view code, param)` pair into the action that answers it,
/// binding the two on first use.
#[derive(Debug)]
pub struct Resolver<T> {
    registry: Arc<BindingRegistry<T>>,
    queue_capacity: Option<usize>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            queue_capacity: self.queue_capacity,
        }
    }
}

impl<T> Resolver<T> {
    pub fn new(registry: Arc<BindingRegistry<T>>, queue_capacity: Option<usize>) -> Self {
        Self {
            registry,
            queue_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<BindingRegistry<T>> {
        &self.registry
    }

    /// The binding a view would get if it isn't bound yet: from the first
    /// template listing `view_code`, or a private 1:1 action otherwise.
    fn new_binding(&self, view_code: &str, param: Option<&str>) -> Option<(String, BTreeSet<String>)> {
        let templates = self.registry.templates();
        let template = templates.as_deref().and_then(|templates| {
            templates
                .iter()
                .filter(|(_action, views)| !views.is_empty())
                .find(|(_action, views)| views.contains(view_code))
        });

        match template {
            Some((action, views)) => {
                let views: BTreeSet<String> =
                    views.iter().map(|view| key::wrap(view, param)).collect();
                Some((key::wrap(action, param), views))
            }
            None => {
                tracing::trace!(view = view_code, "no binding template, binding view to itself");
                let view_key = key::wrap(view_code, param);
                let action = key::synthesized_action(&view_key);
                Some((action, BTreeSet::from([view_key])))
            }
        }
    }

    /// Find the action bound to `view_code` + `param`, creating the binding
    /// if there isn't one. Returns `None` if no binding could be made.
    pub fn resolve_or_create_action(&self, view_code: &str, param: Option<&str>) -> Option<String> {
        if view_code.is_empty() {
            return None;
        }

        let view_key = key::wrap(view_code, param);
        if let Some(action) = self.registry.action_for_view(&view_key) {
            return Some(action);
        }

        let (action, views) = self.new_binding(view_code, param)?;
        if !self.registry.merge_active_binding(&action, views) {
            return None;
        }

        // A concurrent resolution may have bound this view first; the index
        // keeps the earliest binding, so report that one.
        Some(self.registry.action_for_view(&view_key).unwrap_or(action))
    }

    /// The wait queue for `view_code` + `param`, created on first use.
    pub fn queue_for_view(&self, view_code: &str, param: Option<&str>) -> Arc<WaitQueue<T>> {
        let view_key = key::wrap(view_code, param);
        let capacity = self.queue_capacity;
        self.registry
            .queue_for_view(&view_key, || WaitQueue::new(view_key.clone(), capacity))
    }
}
