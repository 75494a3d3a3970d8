//! Requirements, fulfillers and the table provisioning contracts.
//!
//! A test declares [`Requirement`]s describing external state it needs; the
//! lifecycle engine hands the resolved set to every registered [`Fulfiller`]
//! in its scope. Fulfillers pick out the requirements they recognize,
//! provision the described state and return it as context states; after the
//! test they tear their work down in reverse order.

pub mod fulfiller;
pub mod requirement;
pub mod table;

pub use fulfiller::{CleanupError, Fulfiller, FulfillerScope, FulfillmentError, TestStatus};
pub use requirement::{Requirement, RequirementSet, RequirementsProvider};
