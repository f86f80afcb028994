//! Plan and result caching scoped by determinism.

pub mod access_info;
pub mod cachable;
pub mod cache_id;
pub mod cached_results;
pub mod prepared_plan;
pub mod results_store;
pub mod session_cache;

use std::fmt;

use serde::{Deserialize, Serialize};

/// How broadly a computed value stays valid.
///
/// Ordered from narrowest to broadest scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Determinism {
    /// Only valid within the session that computed it.
    Session,
    /// Valid for all sessions of the same user in the same VDB.
    User,
    /// Valid for all sessions in the same VDB version.
    Vdb,
    /// Valid everywhere.
    Deterministic,
}

impl Determinism {
    /// All levels in the order the cache probes them.
    pub const PROBE_ORDER: [Determinism; 4] = [
        Determinism::Session,
        Determinism::User,
        Determinism::Vdb,
        Determinism::Deterministic,
    ];

    /// If values at this level live in the shared tier.
    pub const fn is_shared(&self) -> bool {
        !matches!(self, Determinism::Session)
    }
}

impl fmt::Display for Determinism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "SESSION_DETERMINISTIC",
            Self::User => "USER_DETERMINISTIC",
            Self::Vdb => "VDB_DETERMINISTIC",
            Self::Deterministic => "DETERMINISTIC",
        };
        write!(f, "{s}")
    }
}
