use serde::{Deserialize, Serialize};

use super::Determinism;
use crate::arrays::scalar::ScalarValue;
use crate::metadata::VdbKey;

/// Options affecting how command text is parsed.
///
/// Part of the cache identity since the same text may parse differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ParseInfo {
    pub ansi_quoted_identifiers: bool,
}

/// Identity of a cached plan or result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheId {
    sql: String,
    parse_info: ParseInfo,
    session_id: String,
    user: String,
    vdb: VdbKey,
    /// Bound parameter values, only set for result caching.
    parameters: Option<Vec<ScalarValue>>,
}

impl CacheId {
    pub fn new(
        sql: &str,
        parse_info: ParseInfo,
        session_id: impl Into<String>,
        user: impl Into<String>,
        vdb: VdbKey,
    ) -> Self {
        CacheId {
            sql: canonicalize_sql(sql),
            parse_info,
            session_id: session_id.into(),
            user: user.into(),
            vdb,
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ScalarValue>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn vdb(&self) -> &VdbKey {
        &self.vdb
    }

    /// Get the key for this id in the region for the given determinism.
    ///
    /// Parts of the id that don't matter at a scope are dropped so that
    /// entries are shared across sessions, users or VDB versions.
    pub(crate) fn scoped_key(&self, scope: Determinism) -> ScopedKey {
        let (session_id, user, vdb_version) = match scope {
            Determinism::Session => (
                Some(self.session_id.clone()),
                Some(self.user.clone()),
                Some(self.vdb.version),
            ),
            Determinism::User => (None, Some(self.user.clone()), Some(self.vdb.version)),
            Determinism::Vdb => (None, None, Some(self.vdb.version)),
            Determinism::Deterministic => (None, None, None),
        };

        ScopedKey {
            scope,
            session_id,
            user,
            vdb_name: self.vdb.name.to_lowercase(),
            vdb_version,
            sql: self.sql.clone(),
            parse_info: self.parse_info,
            parameters: self.parameters.clone(),
        }
    }
}

/// Effective identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ScopedKey {
    pub scope: Determinism,
    pub session_id: Option<String>,
    pub user: Option<String>,
    pub vdb_name: String,
    /// Not set for entries shared across versions.
    pub vdb_version: Option<u32>,
    pub sql: String,
    pub parse_info: ParseInfo,
    pub parameters: Option<Vec<ScalarValue>>,
}

impl ScopedKey {
    pub fn matches_vdb(&self, name: &str, version: u32) -> bool {
        self.vdb_name.eq_ignore_ascii_case(name)
            && self.vdb_version.is_none_or(|v| v == version)
    }
}

/// Collapse runs of whitespace and trim.
fn canonicalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(session: &str, user: &str) -> CacheId {
        CacheId::new(
            "select *   from pm1.g1 ",
            ParseInfo::default(),
            session,
            user,
            VdbKey::new("vdb", 1),
        )
    }

    #[test]
    fn serde_roundtrip_keeps_identity() {
        let id = id("s1", "u1").with_parameters(vec![ScalarValue::Float64(1.5), ScalarValue::Null]);
        let json = serde_json::to_string(&id).unwrap();
        let back: CacheId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert_eq!(
            id.scoped_key(Determinism::Session),
            back.scoped_key(Determinism::Session)
        );
    }

    #[test]
    fn whitespace_canonicalized() {
        assert_eq!("select * from pm1.g1", id("s1", "u1").sql());
    }

    #[test]
    fn scopes_drop_identity_parts() {
        let a = id("s1", "u1");
        let b = id("s2", "u1");
        let c = id("s3", "u2");

        assert_ne!(a.scoped_key(Determinism::Session), b.scoped_key(Determinism::Session));
        assert_eq!(a.scoped_key(Determinism::User), b.scoped_key(Determinism::User));
        assert_ne!(a.scoped_key(Determinism::User), c.scoped_key(Determinism::User));
        assert_eq!(a.scoped_key(Determinism::Vdb), c.scoped_key(Determinism::Vdb));

        // Same id at different scopes are different regions.
        assert_ne!(a.scoped_key(Determinism::Vdb), a.scoped_key(Determinism::Deterministic));
    }

    #[test]
    fn global_key_matches_any_version() {
        let key = id("s1", "u1").scoped_key(Determinism::Deterministic);
        assert!(key.matches_vdb("VDB", 1));
        assert!(key.matches_vdb("vdb", 2));
        assert!(!key.matches_vdb("other", 1));

        let key = id("s1", "u1").scoped_key(Determinism::Vdb);
        assert!(!key.matches_vdb("vdb", 2));
    }
}
