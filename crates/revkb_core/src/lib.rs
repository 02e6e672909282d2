//! # revkb Core
//!
//! A versioned, branchable knowledge base over the revkb row storage.
//!
//! Every object keeps its full history: each committed revision adds a new
//! node to the object's validity chain, and any past revision stays
//! readable. Derived views are cached the same way and kept current as
//! commits come in.
//!
//! This crate provides:
//! - [`ValidityChain`]: revision-bounded snapshot history, the one structure
//!   behind item values, association caches and query caches
//! - [`KnowledgeItem`]: a versioned object resolved against committed chains
//! - [`DbContext`]: the unit of work of one writer, with optimistic merge
//!   checks on commit
//! - association caches ([`AssociationQuery`], [`AssociationView`]) kept
//!   current from local edits and commits
//! - [`QueryCache`]: revision-scoped search results adapted to local edits
//! - [`SequenceAllocator`]: chunked id allocation
//! - [`UpdateFeed`]: one event per committed revision
//!
//! ## Example
//!
//! ```rust,ignore
//! use revkb_core::{KnowledgeBase, Schema, TypeDef};
//! use revkb_storage::InMemoryBackend;
//!
//! let schema = Schema::new().with_type(TypeDef::object("Person").value("name"))?;
//! let kb = KnowledgeBase::open(Arc::new(InMemoryBackend::new()), schema)?;
//!
//! let ctx = kb.begin_transaction("ada")?;
//! let x = ctx.create_item("Person")?;
//! ctx.set_value(&x, "name", "a")?;
//! let r1 = ctx.commit()?.unwrap().number;
//!
//! let ctx = kb.begin_transaction("bob")?;
//! ctx.set_value(&x, "name", "b")?;
//! assert_eq!(x.value_at("name", r1)?, Value::from("a"));
//! assert_eq!(ctx.value(&x, "name")?, Value::from("b"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod association;
mod config;
mod context;
mod error;
mod event;
mod identity;
mod item;
mod kb;
mod query;
mod schema;
mod sequence;
mod validity;
mod wrapper;

pub use association::{
    AssociationCache, AssociationQuery, AssociationQueryBuilder, AssociationView, Container,
    ContainerShape, Member,
};
pub use config::{KbConfig, QueryCacheStrategy};
pub use context::{ContextStatus, DbContext, MergeConflict};
pub use error::{CoreError, CoreResult};
pub use event::{
    CommitNotice, CommittedChange, SubscriptionId, UpdateEvent, UpdateFeed, UpdateListener,
};
pub use identity::{ContextId, Revision};
pub use item::{AliveState, FlexData, ItemData, ItemReader, KnowledgeItem};
pub use kb::{CleanupReport, KnowledgeBase, RevisionReader};
pub use query::{CompiledQuery, Operand, QueryCache, SearchScope, SimpleQuery, SimpleQueryBuilder};
pub use schema::{AttributeDef, AttributeKind, AttributeSlot, Schema, TypeBuilder, TypeDef, TypeKind, DEST, SOURCE};
pub use sequence::{SequenceAllocator, OBJECT_ID_SEQUENCE, REVISION_SEQUENCE};
pub use validity::{ChainIter, ChainSlot, Inserted, ValidityChain, ValidityError};
pub use wrapper::{Bound, NoWrappers, Wrapper, WrapperFactory};

pub use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value, CURRENT_REV, FIRST_REV, INITIAL_REV, TRUNK};
