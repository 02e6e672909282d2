//! Binding items to application objects.
//!
//! Applications that want their own types for certain items register a
//! [`WrapperFactory`] when opening the knowledge base. Each item is bound
//! at most once: the first [`crate::KnowledgeBase::wrap`] asks the factory
//! and remembers its answer on the item.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use revkb_codec::ObjectKey;

use crate::item::KnowledgeItem;

/// An application object standing for one item.
///
/// Wrappers address their item by key; holding the item itself would keep
/// it alive through its own binding.
pub trait Wrapper: Send + Sync + fmt::Debug {
    /// Key of the wrapped item.
    fn key(&self) -> &ObjectKey;

    /// For downcasting to the concrete wrapper type.
    fn as_any(&self) -> &dyn Any;
}

/// Creates wrappers for items.
pub trait WrapperFactory: Send + Sync + fmt::Debug {
    /// The wrapper for `item`, or `None` to use the item as is.
    fn wrap(&self, item: &Arc<KnowledgeItem>) -> Option<Arc<dyn Wrapper>>;
}

/// Factory that never wraps.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWrappers;

impl WrapperFactory for NoWrappers {
    fn wrap(&self, _item: &Arc<KnowledgeItem>) -> Option<Arc<dyn Wrapper>> {
        None
    }
}

/// What an item is bound to.
#[derive(Debug, Clone)]
pub enum Bound {
    /// The item is its own application object.
    Item(Arc<KnowledgeItem>),
    /// The item has a wrapper.
    Wrapped(Arc<dyn Wrapper>),
}

impl Bound {
    /// Key of the underlying item.
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Item(item) => item.key(),
            Self::Wrapped(wrapper) => wrapper.key(),
        }
    }

    /// The wrapper as `T`, if this is a wrapper of that type.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Item(_) => None,
            Self::Wrapped(wrapper) => wrapper.as_any().downcast_ref(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Binding {
    Plain,
    Wrapped(Arc<dyn Wrapper>),
}

pub(crate) fn bind(factory: &dyn WrapperFactory, item: &Arc<KnowledgeItem>) -> Bound {
    let binding = item.binding().get_or_init(|| match factory.wrap(item) {
        Some(wrapper) => Binding::Wrapped(wrapper),
        None => Binding::Plain,
    });
    match binding {
        Binding::Plain => Bound::Item(Arc::clone(item)),
        Binding::Wrapped(wrapper) => Bound::Wrapped(Arc::clone(wrapper)),
    }
}
