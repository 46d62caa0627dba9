//! Named prepared statements owned by one connection.

use std::collections::HashMap;

/// A server-side prepared statement created with Parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-side name
    pub name: String,
    /// The SQL text, already in `$n` form
    pub sql: String,
    /// Whether the server currently knows this statement
    pub prepared: bool,
}

impl PreparedStatement {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            prepared: false,
        }
    }
}

/// How a `prepare(name, sql)` request relates to what is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Same name and SQL, already on the server.
    Cached,
    /// Same name with different SQL; the old one must be deallocated.
    Stale,
    /// Registered but not (or no longer) prepared on the server.
    Unprepared,
    Missing,
}

/// Statement map for one connection. Never shared.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<String, PreparedStatement>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str, sql: &str) -> Lookup {
        match self.statements.get(name) {
            None => Lookup::Missing,
            Some(stmt) if stmt.sql != sql => Lookup::Stale,
            Some(stmt) if stmt.prepared => Lookup::Cached,
            Some(_) => Lookup::Unprepared,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.get(name)
    }

    /// Record `name` as prepared with `sql`, replacing any earlier entry.
    pub fn mark_prepared(&mut self, name: &str, sql: &str) -> &PreparedStatement {
        let stmt = self
            .statements
            .entry(name.to_string())
            .or_insert_with(|| PreparedStatement::new(name, sql));
        stmt.sql = sql.to_string();
        stmt.prepared = true;
        stmt
    }

    pub fn remove(&mut self, name: &str) -> Option<PreparedStatement> {
        self.statements.remove(name)
    }

    /// Forget server state (after reconnect) while keeping the SQL, so
    /// statements are re-prepared on next use.
    pub fn invalidate_all(&mut self) {
        for stmt in self.statements.values_mut() {
            stmt.prepared = false;
        }
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.statements.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_states() {
        let mut reg = StatementRegistry::new();
        assert_eq!(reg.lookup("q", "SELECT 1"), Lookup::Missing);

        reg.mark_prepared("q", "SELECT 1");
        assert_eq!(reg.lookup("q", "SELECT 1"), Lookup::Cached);
        assert_eq!(reg.lookup("q", "SELECT 2"), Lookup::Stale);

        reg.invalidate_all();
        assert_eq!(reg.lookup("q", "SELECT 1"), Lookup::Unprepared);
        assert!(!reg.get("q").unwrap().prepared);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut reg = StatementRegistry::new();
        reg.mark_prepared("q", "SELECT 1");
        let stmt = reg.mark_prepared("q", "SELECT $1");
        assert_eq!(stmt.sql, "SELECT $1");
        assert_eq!(reg.len(), 1);

        assert!(reg.remove("q").is_some());
        assert!(reg.remove("q").is_none());
        assert!(reg.is_empty());

        reg.mark_prepared("a", "SELECT 1");
        reg.mark_prepared("b", "SELECT 2");
        let mut names = reg.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        reg.clear();
        assert!(reg.is_empty());
    }
}
