use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dblock_core::{LockError, LockStore};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement, Value};
use tracing::{debug, info, instrument};

use crate::cache::StatementCache;
use crate::dialect::Dialect;

/// Rendered claim statements, shared by every store in the process.
static STATEMENTS: LazyLock<StatementCache<StatementKey, String>> =
    LazyLock::new(StatementCache::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Claim {
    Insert,
    Expired,
    RenewOrClaim,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    dialect: Dialect,
    claim: Claim,
    table: String,
    lease: Duration,
}

impl StatementKey {
    fn render(&self) -> String {
        let table = &self.table;
        let expiry = self.dialect.expiry(self.lease);
        let now = self.dialect.now();
        let token = self.dialect.placeholder(1);

        match self.claim {
            // Conditional so that two first-comers racing on an empty table
            // can't both insert a row.
            Claim::Insert => {
                let from = match self.dialect {
                    Dialect::MySql => " FROM DUAL",
                    Dialect::Postgres | Dialect::Sqlite => "",
                };
                format!(
                    "INSERT INTO {table} (locked_until, token) SELECT {expiry}, {token}{from} \
                     WHERE NOT EXISTS (SELECT 1 FROM {table})"
                )
            }
            Claim::Expired => format!(
                "UPDATE {table} SET token = {token}, locked_until = {expiry} \
                 WHERE locked_until < {now}"
            ),
            Claim::RenewOrClaim => format!(
                "UPDATE {table} SET token = {token}, locked_until = {expiry} \
                 WHERE locked_until < {now} OR token = {}",
                self.dialect.placeholder(2)
            ),
        }
    }
}

/// Lock store backed by a relational database.
///
/// Each lock is a table `{name}(locked_until, token)`. Claims are single
/// conditional `INSERT`/`UPDATE` statements evaluated against the database
/// clock; the database's row-level serialization is the only
/// synchronization between competitors.
///
/// The table name is interpolated into SQL; `DbLock` validates lock names
/// before they reach the store. Tokens are always bound as parameters.
#[derive(Debug, Clone)]
pub struct SqlLockStore {
    db: DatabaseConnection,
    dialect: Dialect,
}

impl SqlLockStore {
    pub fn new(db: DatabaseConnection) -> Self {
        let dialect = Dialect::from_backend(db.get_database_backend());
        Self { db, dialect }
    }

    /// Open a connection pool to `url` (postgres://, mysql:// or sqlite://).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LockError> {
        let mut options = ConnectOptions::new(url.to_string());
        options.max_connections(max_connections).sqlx_logging(false);

        let db = Database::connect(options)
            .await
            .map_err(|e| LockError::store("failed to connect to lock database", e))?;
        let store = Self::new(db);
        info!(dialect = store.dialect.name(), "Connected to lock database");
        Ok(store)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn statement(&self, claim: Claim, table: &str, lease: Duration) -> Arc<String> {
        let key = StatementKey {
            dialect: self.dialect,
            claim,
            table: table.to_string(),
            lease,
        };
        STATEMENTS
            .get_or_prepare(&key, |key| Ok(key.render()))
            .unwrap_or_else(|never: std::convert::Infallible| match never {})
    }

    async fn claim(
        &self,
        claim: Claim,
        context: &str,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        let sql = self.statement(claim, table, lease);
        let values = match claim {
            Claim::RenewOrClaim => vec![Value::from(token), Value::from(token)],
            Claim::Insert | Claim::Expired => vec![Value::from(token)],
        };
        let stmt = Statement::from_sql_and_values(self.dialect.backend(), sql.as_str(), values);

        let result = self
            .db
            .execute(stmt)
            .await
            .map_err(|e| LockError::store(format!("{context} {table}"), e))?;
        let affected = result.rows_affected();
        debug!(table, token, affected, "Executed claim statement");
        Ok(affected)
    }
}

#[async_trait]
impl LockStore for SqlLockStore {
    fn backend_name(&self) -> &'static str {
        self.dialect.name()
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_table(&self, table: &str) -> Result<(), LockError> {
        self.db
            .execute_unprepared(&self.dialect.create_table(table))
            .await
            .map_err(|e| LockError::store(format!("failed to create table {table} for lock"), e))?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_rows(&self, table: &str) -> Result<u64, LockError> {
        let context = format!("failed to check row count for table {table}");
        let stmt = Statement::from_string(
            self.dialect.backend(),
            format!("SELECT COUNT(*) AS n FROM {table}"),
        );

        let row = self
            .db
            .query_one(stmt)
            .await
            .map_err(|e| LockError::store(&context, e))?
            .ok_or_else(|| LockError::store(&context, "no result row"))?;
        let count: i64 = row
            .try_get("", "n")
            .map_err(|e| LockError::store(&context, e))?;
        u64::try_from(count).map_err(|e| LockError::store(&context, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn insert_claim(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        self.claim(Claim::Insert, "can't insert lock row into", table, token, lease)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn claim_expired(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        self.claim(Claim::Expired, "can't claim expired lock", table, token, lease)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew_or_claim(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        self.claim(Claim::RenewOrClaim, "can't renew lock", table, token, lease)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn drop_table(&self, table: &str) -> Result<(), LockError> {
        self.db
            .execute_unprepared(&format!("DROP TABLE IF EXISTS {table}"))
            .await
            .map_err(|e| LockError::store(format!("failed to drop lock table {table}"), e))?;
        Ok(())
    }
}
