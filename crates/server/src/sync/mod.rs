//! Bridge between replicated graph documents and the relational store.

pub mod changes;
pub mod document;
pub mod entries;
pub mod hydrator;
pub mod live;
pub mod persister;
pub mod registry;

pub use document::GraphDocument;
pub use hydrator::{DocumentHydrator, HydrateError};
pub use live::LiveDocument;
pub use persister::{DocumentPersister, DocumentSnapshot, FlushPolicy, PersistOutcome};
pub use registry::{DocumentLookup, SessionRegistry};
