//! veld-core: content-addressed DAG history with distributed branches
//! and locks.
//!
//! History is partitioned into independently synchronized DAGs (users,
//! version control, branches, locks, tags, comments). Branch heads and
//! locks are records in their own DAGs, so they travel with push and pull
//! and reconcile the same way history does. A push that would leave a
//! branch with mutually unreachable heads is rejected unless forced.

pub mod branch;
pub mod changeset;
pub mod closet;
pub mod comments;
pub mod dag;
pub mod error;
pub mod fsutil;
pub mod hash;
pub mod lock;
pub mod records;
pub mod remote;
pub mod repo;
pub mod state;
pub mod store;
pub mod sync;
pub mod tags;
pub mod tree;
pub mod users;

pub use changeset::{ChangesetId, DagId};
pub use closet::Closet;
pub use error::{ErrorCode, VeldError, VeldResult};
pub use repo::{CommitRequest, Repository};
pub use state::RevSpec;
pub use sync::PushOptions;
pub use tree::Tree;
pub use users::UserId;
