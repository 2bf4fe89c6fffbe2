use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;

use crate::{
    error::{Error, Result},
    queue::WaitQueue,
};

/// Action code → view codes. Used both for templates (unparameterized view
/// codes) and for snapshots of the active bindings (concrete view keys).
pub type BindingMap = BTreeMap<String, BTreeSet<String>>;

// Snapshot of the active bindings. `by_view` indexes the first action each
// view key was bound to, so resolution doesn't scan every action.
#[derive(Debug, Clone, Default)]
struct Bindings {
    by_action: HashMap<String, Arc<BTreeSet<String>>>,
    by_view: HashMap<String, String>,
}

impl Bindings {
    fn merged(&self, action: &str, views: &BTreeSet<String>) -> Self {
        let mut next = self.clone();

        let bound = next.by_action.entry(action.to_owned()).or_default();
        Arc::make_mut(bound).extend(views.iter().cloned());

        for view in views {
            next.by_view
                .entry(view.clone())
                .or_insert_with(|| action.to_owned());
        }

        next
    }
}

/// Owns the binding templates, the active action → view bindings, and the
/// wait queue of every view.
///
/// Templates are written once. Active bindings only ever grow: a merge
/// unions new views into an action's set and nothing is removed. Readers
/// work off lock-free snapshots, so resolving a request never contends with
/// a concurrent merge.
pub struct BindingRegistry<T> {
    templates: ArcSwapOption<BindingMap>,
    active: ArcSwap<Bindings>,
    queues: DashMap<String, Arc<WaitQueue<T>>>,
}

impl<T> Default for BindingRegistry<T> {
    fn default() -> Self {
        Self {
            templates: ArcSwapOption::empty(),
            active: ArcSwap::from_pointee(Bindings::default()),
            queues: DashMap::new(),
        }
    }
}

impl<T> Debug for BindingRegistry<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("templates", &self.templates.load_full())
            .field("actions", &self.active.load().by_action.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl<T> BindingRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the binding templates. Only the first non-empty map is kept;
    /// later calls return `Ok(false)` and change nothing. An empty map is an
    /// error while no templates are installed.
    pub fn init_templates(&self, templates: BindingMap) -> Result<bool> {
        if self.templates.load().is_some() {
            tracing::debug!("binding templates already installed, ignoring");
            return Ok(false);
        }

        if templates.is_empty() {
            return Err(Error::Config("action to view bindings must not be empty".into()));
        }

        let empty: Option<Arc<BindingMap>> = None;
        let previous = self.templates.compare_and_swap(&empty, Some(Arc::new(templates)));
        Ok(previous.is_none())
    }

    /// The installed templates, if any.
    pub fn templates(&self) -> Option<Arc<BindingMap>> {
        self.templates.load_full()
    }

    /// Union `views` into the set bound to `action`. Returns false, without
    /// touching anything, if either is empty.
    pub fn merge_active_binding<I>(&self, action: &str, views: I) -> bool
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let views: BTreeSet<String> = views.into_iter().map(Into::into).collect();

        if action.is_empty() || views.is_empty() {
            tracing::warn!(action, "refusing to bind an empty action or view set");
            return false;
        }

        self.active.rcu(|current| current.merged(action, &views));
        tracing::trace!(action, ?views, "bound views to action");
        true
    }

    /// The views currently bound to `action`.
    pub fn views_for_action(&self, action: &str) -> Option<Arc<BTreeSet<String>>> {
        self.active.load().by_action.get(action).cloned()
    }

    /// The action a view key is bound to, if any.
    pub fn action_for_view(&self, view_key: &str) -> Option<String> {
        self.active.load().by_view.get(view_key).cloned()
    }

    /// A snapshot of every active binding.
    pub fn actions(&self) -> BindingMap {
        self.active
            .load()
            .by_action
            .iter()
            .map(|(action, views)| (action.clone(), BTreeSet::clone(views)))
            .collect()
    }

    /// Get the wait queue for `view_key`, installing the one built by
    /// `factory` if there is none yet. An existing queue is never replaced.
    pub fn queue_for_view(
        &self,
        view_key: &str,
        factory: impl FnOnce() -> WaitQueue<T>,
    ) -> Arc<WaitQueue<T>> {
        if let Some(queue) = self.queues.get(view_key) {
            return Arc::clone(queue.value());
        }

        let queue = self
            .queues
            .entry(view_key.to_owned())
            .or_insert_with(|| Arc::new(factory()));
        Arc::clone(queue.value())
    }

    /// The wait queue for `view_key`, if one was ever created.
    pub fn queue(&self, view_key: &str) -> Option<Arc<WaitQueue<T>>> {
        self.queues.get(view_key).map(|queue| Arc::clone(queue.value()))
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
