//! Equivalence-set discovery for weft contexts.
//!
//! An equivalence set is the authoritative consistency-tracking object for
//! a sub-region and a set of fields. Each region requirement of a context
//! has an [`EqKDRoot`] mapping sub-regions to the sets that own them;
//! the tree grows lazily as queries arrive and can be refined or
//! invalidated under its lock. The [`OwnershipLedger`] decides when a
//! distributed object may be deleted, and the [`ReportCollector`] gathers
//! answers from remote owners.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod ledger;
pub mod rect;
pub mod report;
pub mod set;
pub mod tree;

pub use error::EqSetError;
pub use ledger::{OwnershipLedger, Release};
pub use rect::Rect;
pub use report::ReportCollector;
pub use set::{merge_by_did, EquivalenceSet, SetOverlap};
pub use tree::{EqKDRoot, EqKDTree, EqSetLookup, RemoteSubtree, SetFactory};
