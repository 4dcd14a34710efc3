//! Typed event fan-out.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::IdSeq;

/// Handle returned by [`EventBus::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<K, E> {
	ids: IdSeq,
	by_kind: HashMap<K, Vec<(ListenerId, Listener<E>)>>,
}

/// Ordered listener lists keyed by event kind.
///
/// Dispatch calls a snapshot of the list, so listeners may add or remove listeners
/// (themselves included) while being called. Changes apply from the next dispatch.
pub struct EventBus<K, E> {
	registry: Mutex<Registry<K, E>>,
}

impl<K: Eq + Hash, E> Default for EventBus<K, E> {
	fn default() -> Self {
		Self {
			registry: Mutex::new(Registry {
				ids: IdSeq::default(),
				by_kind: HashMap::new(),
			}),
		}
	}
}

impl<K: Eq + Hash, E> EventBus<K, E> {
	/// Creates an empty bus.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a listener for `kind`.
	pub fn add(&self, kind: K, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
		let mut registry = self.registry.lock();
		let id = ListenerId(registry.ids.take());
		registry.by_kind.entry(kind).or_default().push((id, Arc::new(listener)));
		id
	}

	/// Removes a listener. Returns false if it was not registered under `kind`.
	pub fn remove(&self, kind: &K, id: ListenerId) -> bool {
		let mut registry = self.registry.lock();
		let Some(list) = registry.by_kind.get_mut(kind) else {
			return false;
		};
		let before = list.len();
		list.retain(|(lid, _)| *lid != id);
		before != list.len()
	}

	/// Calls every listener of `kind` in registration order. Returns how many were called.
	pub fn dispatch(&self, kind: &K, event: &E) -> usize {
		let snapshot: Vec<Listener<E>> = self
			.registry
			.lock()
			.by_kind
			.get(kind)
			.map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
			.unwrap_or_default();
		for listener in &snapshot {
			listener(event);
		}
		snapshot.len()
	}

	/// Number of listeners registered for `kind`.
	pub fn listener_count(&self, kind: &K) -> usize {
		self.registry.lock().by_kind.get(kind).map_or(0, Vec::len)
	}
}

impl<K, E> fmt::Debug for EventBus<K, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let registry = self.registry.lock();
		let listeners: usize = registry.by_kind.values().map(Vec::len).sum();
		f.debug_struct("EventBus").field("listeners", &listeners).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn dispatch_runs_listeners_in_order_per_kind() {
		let bus = EventBus::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		for tag in ["first", "second"] {
			let log = Arc::clone(&log);
			bus.add("msg", move |e: &u32| log.lock().push(format!("{tag}:{e}")));
		}
		let other = Arc::clone(&log);
		bus.add("close", move |_: &u32| other.lock().push("closed".into()));

		assert_eq!(bus.dispatch(&"msg", &7), 2);
		assert_eq!(bus.dispatch(&"open", &0), 0);
		assert_eq!(*log.lock(), vec!["first:7", "second:7"]);
	}

	#[test]
	fn remove_only_matches_its_kind() {
		let bus: EventBus<&str, ()> = EventBus::new();
		let id = bus.add("msg", |_| {});
		assert!(!bus.remove(&"close", id));
		assert!(bus.remove(&"msg", id));
		assert!(!bus.remove(&"msg", id));
		assert_eq!(bus.listener_count(&"msg"), 0);
	}

	#[test]
	fn listener_may_unregister_itself_during_dispatch() {
		let bus: Arc<EventBus<&str, ()>> = Arc::new(EventBus::new());
		let hits = Arc::new(AtomicUsize::new(0));
		let slot = Arc::new(Mutex::new(None));
		let id = bus.add("msg", {
			let bus = Arc::downgrade(&bus);
			let hits = Arc::clone(&hits);
			let slot = Arc::clone(&slot);
			move |_| {
				hits.fetch_add(1, Ordering::SeqCst);
				if let (Some(bus), Some(id)) = (bus.upgrade(), *slot.lock()) {
					bus.remove(&"msg", id);
				}
			}
		});
		*slot.lock() = Some(id);
		let later = Arc::clone(&hits);
		bus.add("msg", move |_| {
			later.fetch_add(10, Ordering::SeqCst);
		});

		assert_eq!(bus.dispatch(&"msg", &()), 2);
		assert_eq!(bus.dispatch(&"msg", &()), 1);
		assert_eq!(hits.load(Ordering::SeqCst), 21);
	}
}
