//! User-defined events and their handlers.
//!
//! An [`EventId`] names an event kind on one loop. Reports are queued and
//! delivered on a later pass to every handler registered at report time,
//! in registration order.
//!
//! Two delivery kinds exist, selected by the id's second type parameter:
//!
//! - [`ByValue`]: handlers get `&T` borrowed from one shared copy.
//! - [`RefCounted`]: handlers get an `Rc<T>`. The payload is dropped exactly
//!   once, after the last handler lets go of it (or straight away when
//!   nobody is listening).

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{EventLoop, LoopError, ReadyItem};
use crate::handle::{HandleMap, SafeRef};
use crate::trace::trace;

/// Delivery marker: handlers borrow the payload.
#[derive(Debug, Clone, Copy)]
pub struct ByValue;

/// Delivery marker: handlers share ownership of the payload.
#[derive(Debug, Clone, Copy)]
pub struct RefCounted;

/// Identifier of an event kind carrying payloads of type `T`.
///
/// Ids are bound to the loop that created them; using one on another loop
/// panics.
pub struct EventId<T, K = ByValue> {
    owner: u32,
    index: u32,
    _marker: PhantomData<fn() -> (T, K)>,
}

impl<T, K> Copy for EventId<T, K> {}

impl<T, K> Clone for EventId<T, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, K> fmt::Debug for EventId<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}.{})", self.owner, self.index)
    }
}

type ErasedHandler = Rc<dyn Fn(&EventLoop, &Rc<dyn Any>)>;

/// A registered event handler. Only reachable through a [`HandlerRef`].
pub struct Handler {
    event: u32,
    callback: ErasedHandler,
}

/// Reference to a registered event handler.
pub type HandlerRef = SafeRef<Handler>;

struct EventKind {
    name: String,
    handlers: Vec<HandlerRef>,
}

/// Source of registry owner ids, unique per process.
static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

pub(crate) struct EventRegistry {
    owner: u32,
    kinds: Vec<EventKind>,
    handlers: HandleMap<Handler>,
}

impl EventRegistry {
    pub(crate) fn new(loop_name: &str) -> Self {
        Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            kinds: Vec::new(),
            handlers: HandleMap::new(format!("{loop_name}.handlers"), 16),
        }
    }

    fn create<T, K>(&mut self, name: String) -> EventId<T, K> {
        // One kind per call site in practice; u32 is plenty.
        let index = self.kinds.len() as u32;
        self.kinds.push(EventKind {
            name,
            handlers: Vec::new(),
        });
        EventId {
            owner: self.owner,
            index,
            _marker: PhantomData,
        }
    }

    /// Index of `id` in this registry.
    fn index_of<T, K>(&self, id: EventId<T, K>) -> u32 {
        assert!(
            id.owner == self.owner,
            "event id {id:?} was created on another loop"
        );
        id.index
    }

    fn kind(&mut self, index: u32) -> &mut EventKind {
        self.kinds
            .get_mut(index as usize)
            .unwrap_or_else(|| panic!("event id {index} was not created on this loop"))
    }

    fn add(&mut self, event: u32, callback: ErasedHandler) -> Result<HandlerRef, LoopError> {
        self.kind(event);
        let handler = self.handlers.create_ref(Handler { event, callback })?;
        self.kind(event).handlers.push(handler);
        Ok(handler)
    }
}

impl EventLoop {
    /// Declares a by-value event kind.
    pub fn create_event_id<T: 'static>(&self, name: impl Into<String>) -> EventId<T> {
        self.inner.registry.borrow_mut().create(name.into())
    }

    /// Declares a reference-counted event kind.
    pub fn create_ref_counted_event_id<T: 'static>(
        &self,
        name: impl Into<String>,
    ) -> EventId<T, RefCounted> {
        self.inner.registry.borrow_mut().create(name.into())
    }

    /// Diagnostic name of an event kind.
    #[must_use]
    pub fn event_name<T, K>(&self, id: EventId<T, K>) -> String {
        let mut registry = self.inner.registry.borrow_mut();
        let index = registry.index_of(id);
        registry.kind(index).name.clone()
    }

    /// Registers a handler for a by-value event.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler table is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created on this loop.
    pub fn add_handler<T: 'static>(
        &self,
        id: EventId<T>,
        handler: impl Fn(&EventLoop, &T) + 'static,
    ) -> Result<HandlerRef, LoopError> {
        let callback: ErasedHandler = Rc::new(move |l: &EventLoop, payload: &Rc<dyn Any>| {
            if let Some(value) = payload.downcast_ref::<T>() {
                handler(l, value);
            }
        });
        let mut registry = self.inner.registry.borrow_mut();
        let index = registry.index_of(id);
        registry.add(index, callback)
    }

    /// Registers a handler for a reference-counted event.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler table is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created on this loop.
    pub fn add_ref_counted_handler<T: 'static>(
        &self,
        id: EventId<T, RefCounted>,
        handler: impl Fn(&EventLoop, Rc<T>) + 'static,
    ) -> Result<HandlerRef, LoopError> {
        let callback: ErasedHandler = Rc::new(move |l: &EventLoop, payload: &Rc<dyn Any>| {
            if let Ok(value) = Rc::clone(payload).downcast::<T>() {
                handler(l, value);
            }
        });
        let mut registry = self.inner.registry.borrow_mut();
        let index = registry.index_of(id);
        registry.add(index, callback)
    }

    /// Unregisters a handler. Reports already queued for it are discarded.
    ///
    /// # Panics
    ///
    /// Panics if `handler` is not registered on this loop.
    pub fn remove_handler(&self, handler: HandlerRef) {
        let mut registry = self.inner.registry.borrow_mut();
        let Some(removed) = registry.handlers.delete_ref(handler) else {
            panic!("unknown event handler {handler}");
        };
        registry
            .kind(removed.event)
            .handlers
            .retain(|h| *h != handler);
    }

    /// Reports a by-value event. Handlers run on a later pass.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created on this loop.
    pub fn report<T: 'static>(&self, id: EventId<T>, payload: T) {
        let index = self.inner.registry.borrow().index_of(id);
        self.queue_report(index, Rc::new(payload));
    }

    /// Reports a reference-counted event, transferring ownership of
    /// `payload` to the handlers.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created on this loop.
    pub fn report_ref_counted<T: 'static>(&self, id: EventId<T, RefCounted>, payload: T) {
        let index = self.inner.registry.borrow().index_of(id);
        self.queue_report(index, Rc::new(payload));
    }

    fn queue_report(&self, event: u32, payload: Rc<dyn Any>) {
        let handlers = {
            let mut registry = self.inner.registry.borrow_mut();
            let kind = registry.kind(event);
            trace!(event = %kind.name, handlers = kind.handlers.len(), "event reported");
            kind.handlers.clone()
        };
        for handler in handlers {
            self.push_ready(ReadyItem::Event {
                handler,
                payload: Rc::clone(&payload),
            });
        }
    }

    pub(crate) fn dispatch_event(&self, handler: HandlerRef, payload: &Rc<dyn Any>) {
        let callback = {
            let registry = self.inner.registry.borrow();
            match registry.handlers.lookup(handler) {
                Some(h) => Rc::clone(&h.callback),
                None => return,
            }
        };
        callback(self, payload);
    }
}
