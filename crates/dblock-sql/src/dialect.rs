use std::time::Duration;

use sea_orm::DbBackend;

/// SQL flavour of the connected database.
///
/// Lease arithmetic is always done with the server's clock so that every
/// competitor compares against the same time source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_backend(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => Dialect::Postgres,
            DbBackend::MySql => Dialect::MySql,
            DbBackend::Sqlite => Dialect::Sqlite,
        }
    }

    pub fn backend(self) -> DbBackend {
        match self {
            Dialect::Postgres => DbBackend::Postgres,
            Dialect::MySql => DbBackend::MySql,
            Dialect::Sqlite => DbBackend::Sqlite,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Comma-separated placeholders for `count` parameters, e.g. `$1,$2,$3`.
    pub fn placeholders(self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Expression for the current server time, in the unit of `locked_until`.
    ///
    /// SQLite has no native timestamp type, so there `locked_until` holds
    /// epoch milliseconds.
    pub fn now(self) -> &'static str {
        match self {
            Dialect::Postgres => "now()",
            Dialect::MySql => "NOW(3)",
            Dialect::Sqlite => "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)",
        }
    }

    /// Expression for `now + lease`.
    pub fn expiry(self, lease: Duration) -> String {
        match self {
            Dialect::Postgres => format!("now() + interval '{} milliseconds'", lease.as_millis()),
            Dialect::MySql => format!("NOW(3) + INTERVAL {} MICROSECOND", lease.as_micros()),
            Dialect::Sqlite => format!("({} + {})", self.now(), lease.as_millis()),
        }
    }

    pub fn create_table(self, table: &str) -> String {
        let locked_until = match self {
            Dialect::Postgres => "TIMESTAMPTZ",
            Dialect::MySql => "TIMESTAMP(3) NULL",
            Dialect::Sqlite => "BIGINT",
        };
        format!("CREATE TABLE IF NOT EXISTS {table} (locked_until {locked_until}, token BIGINT)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholders(3), "$1,$2,$3");
        assert_eq!(Dialect::MySql.placeholders(2), "?,?");
        assert_eq!(Dialect::Sqlite.placeholders(0), "");
    }

    #[test]
    fn test_expiry() {
        let lease = Duration::from_millis(40);
        assert_eq!(
            Dialect::Postgres.expiry(lease),
            "now() + interval '40 milliseconds'"
        );
        assert_eq!(
            Dialect::MySql.expiry(lease),
            "NOW(3) + INTERVAL 40000 MICROSECOND"
        );
        assert!(Dialect::Sqlite.expiry(lease).ends_with("+ 40)"));
    }

    #[test]
    fn test_create_table() {
        assert_eq!(
            Dialect::Sqlite.create_table("jobs"),
            "CREATE TABLE IF NOT EXISTS jobs (locked_until BIGINT, token BIGINT)"
        );
    }
}
