//! Capacity-bounded container holder
//!
//! Pure bookkeeping: the slot counter and the container map are only ever
//! changed together, under the node's own lock.

use super::container::Container;
use crate::models::{ContainerId, ContainerView, NodeId, NodeView};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Slots {
    used: usize,
    containers: BTreeMap<ContainerId, Container>,
}

/// A node hosting up to `capacity` containers (more when overcommitted)
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    capacity: usize,
    slots: Mutex<Slots>,
}

impl Node {
    pub fn new(id: NodeId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a container and take a slot for it
    pub fn add(&self, container: Container) {
        let mut slots = self.lock();
        if slots.containers.insert(container.id(), container).is_none() {
            slots.used += 1;
        }
        debug_assert_eq!(slots.used, slots.containers.len());
    }

    /// Unregister a container and release its slot
    pub fn remove(&self, id: ContainerId) -> Option<Container> {
        let mut slots = self.lock();
        let removed = slots.containers.remove(&id);
        if removed.is_some() {
            slots.used -= 1;
        }
        debug_assert_eq!(slots.used, slots.containers.len());
        removed
    }

    /// `(used_slots, capacity)`
    pub fn snapshot(&self) -> (usize, usize) {
        (self.lock().used, self.capacity)
    }

    pub fn has_free_slot(&self) -> bool {
        self.lock().used < self.capacity
    }

    pub fn contains(&self, id: ContainerId) -> bool {
        self.lock().containers.contains_key(&id)
    }

    pub fn container(&self, id: ContainerId) -> Option<ContainerView> {
        self.lock().containers.get(&id).map(Container::view)
    }

    /// Slot counter and map length, read in one critical section
    pub fn counts(&self) -> (usize, usize) {
        let slots = self.lock();
        (slots.used, slots.containers.len())
    }

    pub fn view(&self) -> NodeView {
        let slots = self.lock();
        NodeView {
            id: self.id,
            capacity: self.capacity,
            used_slots: slots.used,
            containers: slots.containers.values().map(Container::view).collect(),
        }
    }

    /// Visit every hosted container while holding the node lock
    pub(crate) fn for_each_container(&self, mut f: impl FnMut(&Container)) {
        let slots = self.lock();
        slots.containers.values().for_each(|c| f(c));
    }
}
