pub mod error {
    use std::net::SocketAddr;
    use std::time::Duration;

    use scylla::transport::errors::QueryError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum Error {
        /// No contact point answered within the bootstrap retry window.
        #[error("no node reachable at {contact_points:?} after {attempts} attempt(s): {reason}")]
        Connection {
            contact_points: Vec<String>,
            attempts: u32,
            reason: String,
        },

        #[error("node at {addr} not ready within {timeout:?}: {detail}")]
        StartupTimeout {
            addr: SocketAddr,
            timeout: Duration,
            detail: String,
        },

        /// An existing keyspace or table does not match the requested definition.
        #[error("schema conflict on {object}: {detail}")]
        SchemaConflict { object: String, detail: String },

        #[error("not ready: {0}")]
        NotReady(String),

        #[error("codec error on column '{column}': {detail}")]
        Codec { column: String, detail: String },

        #[error("write to {table} failed: {source}")]
        Write {
            table: String,
            #[source]
            source: QueryError,
        },

        #[error("read from {target} failed: {source}")]
        Read {
            target: String,
            #[source]
            source: QueryError,
        },

        #[error("statement `{statement}` failed: {source}")]
        Statement {
            statement: String,
            #[source]
            source: QueryError,
        },

        /// Lookup on a column that is neither the partition key nor backed by
        /// a declared index or a materialized view.
        #[error("lookup on {table}.{column} has no backing index or view")]
        QueryNotSupported { table: String, column: String },

        #[error("invalid identifier '{0}'")]
        InvalidIdentifier(String),

        #[error("invalid paging cursor: {0}")]
        InvalidCursor(String),

        #[error("invalid configuration: {0}")]
        Config(String),

        #[error("failed to launch node: {0}")]
        Launch(#[from] std::io::Error),
    }

    impl Error {
        pub(crate) fn codec(column: &str, detail: impl Into<String>) -> Self {
            Error::Codec {
                column: column.to_string(),
                detail: detail.into(),
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

pub mod config {
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    use scylla::statement::Consistency;
    use serde::Deserialize;

    use crate::error::{Error, Result};
    use crate::schema::{sanitize_ident, KeyspaceSpec, ReplicationSpec};

    pub const DEFAULT_HOST: &str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 9042;
    pub const DEFAULT_KEYSPACE: &str = "test_01";

    /// What a repository does with its keyspace and table when it is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
    #[serde(rename_all = "snake_case")]
    pub enum SchemaAction {
        /// Only verify that the keyspace and table exist.
        None,
        #[default]
        CreateIfNotExists,
        /// Drop the table and create it again from the entity declaration.
        Recreate,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
    #[serde(rename_all = "snake_case")]
    pub enum ConsistencyLevel {
        #[default]
        One,
        LocalOne,
        Quorum,
        LocalQuorum,
        All,
    }

    impl From<ConsistencyLevel> for Consistency {
        fn from(level: ConsistencyLevel) -> Self {
            match level {
                ConsistencyLevel::One => Consistency::One,
                ConsistencyLevel::LocalOne => Consistency::LocalOne,
                ConsistencyLevel::Quorum => Consistency::Quorum,
                ConsistencyLevel::LocalQuorum => Consistency::LocalQuorum,
                ConsistencyLevel::All => Consistency::All,
            }
        }
    }

    /// Bounded retry window for the connection bootstrap.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct ConnectOptions {
        pub attempts: u32,
        pub initial_backoff_ms: u64,
        pub max_backoff_ms: u64,
        /// Upper bound for a single attempt, including the initial metadata fetch.
        pub connect_timeout_ms: u64,
    }

    impl Default for ConnectOptions {
        fn default() -> Self {
            Self {
                attempts: 5,
                initial_backoff_ms: 200,
                max_backoff_ms: 3_000,
                connect_timeout_ms: 5_000,
            }
        }
    }

    impl ConnectOptions {
        pub fn initial_backoff(&self) -> Duration {
            Duration::from_millis(self.initial_backoff_ms)
        }

        pub fn max_backoff(&self) -> Duration {
            Duration::from_millis(self.max_backoff_ms)
        }

        pub fn connect_timeout(&self) -> Duration {
            Duration::from_millis(self.connect_timeout_ms)
        }

        /// Backoff to wait after the given 1-based failed attempt.
        pub fn backoff_after(&self, attempt: u32) -> Duration {
            let factor = 1u64 << attempt.saturating_sub(1).min(16);
            let ms = self.initial_backoff_ms.saturating_mul(factor);
            Duration::from_millis(ms.min(self.max_backoff_ms))
        }
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(default)]
    pub struct TlsConfig {
        pub enabled: bool,
        pub ca_bundle: Option<PathBuf>,
        /// Skip peer verification.
        pub insecure: bool,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct ClientConfig {
        /// `host` or `host:port`; bare hosts use `port`.
        pub contact_points: Vec<String>,
        pub port: u16,
        pub user: Option<String>,
        pub password: Option<String>,
        pub tls: TlsConfig,
        pub keyspace: KeyspaceSpec,
        pub schema_action: SchemaAction,
        pub consistency: ConsistencyLevel,
        pub request_timeout_ms: u64,
        pub connect: ConnectOptions,
    }

    impl Default for ClientConfig {
        fn default() -> Self {
            Self {
                contact_points: vec![DEFAULT_HOST.to_string()],
                port: DEFAULT_PORT,
                user: None,
                password: None,
                tls: TlsConfig::default(),
                keyspace: KeyspaceSpec::default(),
                schema_action: SchemaAction::default(),
                consistency: ConsistencyLevel::default(),
                request_timeout_ms: 10_000,
                connect: ConnectOptions::default(),
            }
        }
    }

    fn env_flag(name: &str) -> bool {
        env::var(name)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn parse_contact_points(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    impl ClientConfig {
        /// Defaults overridden by `SCYLLA_URI`, `SCYLLA_USER`/`SCYLLA_PASS`,
        /// `SCYLLA_SSL`, `SCYLLA_CA_BUNDLE`, `SCYLLA_SSL_INSECURE` and `SCYLLA_KEYSPACE`.
        pub fn from_env() -> Result<Self> {
            let mut cfg = Self::default();
            if let Ok(uri) = env::var("SCYLLA_URI") {
                cfg.contact_points = parse_contact_points(&uri);
            }
            if let (Ok(user), Ok(pass)) = (env::var("SCYLLA_USER"), env::var("SCYLLA_PASS")) {
                cfg.user = Some(user);
                cfg.password = Some(pass);
            }
            cfg.tls.enabled = env_flag("SCYLLA_SSL");
            cfg.tls.ca_bundle = env::var_os("SCYLLA_CA_BUNDLE").map(PathBuf::from);
            cfg.tls.insecure = env_flag("SCYLLA_SSL_INSECURE");
            if let Ok(keyspace) = env::var("SCYLLA_KEYSPACE") {
                cfg.keyspace.name = keyspace;
            }
            cfg.validate()?;
            Ok(cfg)
        }

        pub fn from_json_str(raw: &str) -> Result<Self> {
            let cfg: Self = serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
            cfg.validate()?;
            Ok(cfg)
        }

        pub fn validate(&self) -> Result<()> {
            if self.contact_points.is_empty() {
                return Err(Error::Config("at least one contact point is required".into()));
            }
            if self.connect.attempts == 0 {
                return Err(Error::Config("connect.attempts must be at least 1".into()));
            }
            if self.user.is_some() != self.password.is_some() {
                return Err(Error::Config("user and password must be set together".into()));
            }
            if !sanitize_ident(&self.keyspace.name) {
                return Err(Error::InvalidIdentifier(self.keyspace.name.clone()));
            }
            match &self.keyspace.replication {
                ReplicationSpec::Simple { replication_factor } if *replication_factor == 0 => {
                    Err(Error::Config("replication_factor must be at least 1".into()))
                }
                ReplicationSpec::NetworkTopology { datacenters } if datacenters.is_empty() => {
                    Err(Error::Config(
                        "NetworkTopologyStrategy needs at least one datacenter".into(),
                    ))
                }
                _ => Ok(()),
            }
        }

        pub fn request_timeout(&self) -> Duration {
            Duration::from_millis(self.request_timeout_ms)
        }
    }
}

pub mod schema {
    use std::collections::BTreeMap;

    use serde::Deserialize;
    use tracing::{debug, info, info_span, Instrument};

    use crate::catalog::{self, IndexMeta, KeyspaceDescription, TableDescription};
    use crate::codec::Entity;
    use crate::config::{SchemaAction, DEFAULT_KEYSPACE};
    use crate::connection::Connection;
    use crate::error::{Error, Result};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ColumnType {
        Text,
        Float,
        Double,
        Int,
        BigInt,
        Boolean,
    }

    impl ColumnType {
        pub fn cql_name(&self) -> &'static str {
            match self {
                ColumnType::Text => "text",
                ColumnType::Float => "float",
                ColumnType::Double => "double",
                ColumnType::Int => "int",
                ColumnType::BigInt => "bigint",
                ColumnType::Boolean => "boolean",
            }
        }

        pub fn from_cql_name(name: &str) -> Option<Self> {
            match name.trim().to_ascii_lowercase().as_str() {
                "text" | "varchar" => Some(ColumnType::Text),
                "float" => Some(ColumnType::Float),
                "double" => Some(ColumnType::Double),
                "int" => Some(ColumnType::Int),
                "bigint" => Some(ColumnType::BigInt),
                "boolean" => Some(ColumnType::Boolean),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ColumnKind {
        PartitionKey,
        Clustering,
        Regular,
    }

    impl ColumnKind {
        /// Name used in `system_schema.columns.kind`.
        pub fn catalog_name(&self) -> &'static str {
            match self {
                ColumnKind::PartitionKey => "partition_key",
                ColumnKind::Clustering => "clustering",
                ColumnKind::Regular => "regular",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColumnDef {
        pub name: &'static str,
        pub ty: ColumnType,
        pub kind: ColumnKind,
    }

    impl ColumnDef {
        pub const fn partition_key(name: &'static str, ty: ColumnType) -> Self {
            Self {
                name,
                ty,
                kind: ColumnKind::PartitionKey,
            }
        }

        pub const fn clustering(name: &'static str, ty: ColumnType) -> Self {
            Self {
                name,
                ty,
                kind: ColumnKind::Clustering,
            }
        }

        pub const fn regular(name: &'static str, ty: ColumnType) -> Self {
            Self {
                name,
                ty,
                kind: ColumnKind::Regular,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IndexDef {
        pub name: &'static str,
        pub column: &'static str,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(tag = "class", rename_all = "snake_case")]
    pub enum ReplicationSpec {
        Simple { replication_factor: u32 },
        NetworkTopology { datacenters: BTreeMap<String, u32> },
    }

    impl ReplicationSpec {
        pub fn simple(replication_factor: u32) -> Self {
            ReplicationSpec::Simple { replication_factor }
        }

        pub fn class_name(&self) -> &'static str {
            match self {
                ReplicationSpec::Simple { .. } => "SimpleStrategy",
                ReplicationSpec::NetworkTopology { .. } => "NetworkTopologyStrategy",
            }
        }

        pub fn to_cql_map(&self) -> String {
            match self {
                ReplicationSpec::Simple { replication_factor } => format!(
                    "{{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    replication_factor
                ),
                ReplicationSpec::NetworkTopology { datacenters } => {
                    let mut out = String::from("{'class': 'NetworkTopologyStrategy'");
                    for (dc, rf) in datacenters {
                        out.push_str(&format!(", '{}': {}", dc.replace('\'', "''"), rf));
                    }
                    out.push('}');
                    out
                }
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(default)]
    pub struct KeyspaceSpec {
        pub name: String,
        pub replication: ReplicationSpec,
        pub durable_writes: bool,
    }

    impl Default for KeyspaceSpec {
        fn default() -> Self {
            Self {
                name: DEFAULT_KEYSPACE.to_string(),
                replication: ReplicationSpec::simple(1),
                durable_writes: true,
            }
        }
    }

    impl KeyspaceSpec {
        pub fn new(name: impl Into<String>, replication: ReplicationSpec) -> Self {
            Self {
                name: name.into(),
                replication,
                durable_writes: true,
            }
        }

        pub fn create_cql(&self) -> Result<String> {
            let name = require_ident(&self.name)?;
            let mut cql = format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {}",
                name,
                self.replication.to_cql_map()
            );
            if !self.durable_writes {
                cql.push_str(" AND durable_writes = false");
            }
            cql.push(';');
            Ok(cql)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TableSchema {
        pub keyspace: String,
        pub table: String,
        pub columns: Vec<ColumnDef>,
    }

    impl TableSchema {
        pub fn for_entity<E: Entity>(keyspace: &str) -> Self {
            Self {
                keyspace: keyspace.to_string(),
                table: E::TABLE.to_string(),
                columns: E::columns().to_vec(),
            }
        }

        pub fn qualified_name(&self) -> String {
            format!("{}.{}", self.keyspace, self.table)
        }

        pub fn partition_keys(&self) -> Vec<&'static str> {
            self.columns_of(ColumnKind::PartitionKey)
        }

        pub fn clustering_keys(&self) -> Vec<&'static str> {
            self.columns_of(ColumnKind::Clustering)
        }

        fn columns_of(&self, kind: ColumnKind) -> Vec<&'static str> {
            self.columns
                .iter()
                .filter(|c| c.kind == kind)
                .map(|c| c.name)
                .collect()
        }

        pub fn column(&self, name: &str) -> Option<&ColumnDef> {
            self.columns.iter().find(|c| c.name == name)
        }

        /// Comma separated column list in declaration order.
        pub fn column_list(&self) -> String {
            self.columns
                .iter()
                .map(|c| c.name)
                .collect::<Vec<_>>()
                .join(", ")
        }

        pub fn validate(&self) -> Result<()> {
            require_ident(&self.keyspace)?;
            require_ident(&self.table)?;
            for c in &self.columns {
                require_ident(c.name)?;
            }
            if self.partition_keys().is_empty() {
                return Err(Error::SchemaConflict {
                    object: self.qualified_name(),
                    detail: "no partition key declared".into(),
                });
            }
            Ok(())
        }

        pub fn create_cql(&self) -> Result<String> {
            self.validate()?;
            let mut defs: Vec<String> = self
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.ty.cql_name()))
                .collect();
            let mut primary = format!("(({})", self.partition_keys().join(", "));
            for ck in self.clustering_keys() {
                primary.push_str(", ");
                primary.push_str(ck);
            }
            primary.push(')');
            defs.push(format!("PRIMARY KEY {}", primary));
            Ok(format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                self.qualified_name(),
                defs.join(", ")
            ))
        }
    }

    pub fn sanitize_ident(ident: &str) -> bool {
        let bytes = ident.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let first = bytes[0];
        let is_letter = |c: u8| c.is_ascii_alphabetic() || c == b'_';
        let is_alnum = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
        if !is_letter(first) {
            return false;
        }
        bytes.iter().all(|&c| is_alnum(c))
    }

    pub fn require_ident(ident: &str) -> Result<&str> {
        if sanitize_ident(ident) {
            Ok(ident)
        } else {
            Err(Error::InvalidIdentifier(ident.to_string()))
        }
    }

    /// Whether `index` already exists on `schema`'s table. An index of the
    /// same name over a different column is a conflict.
    pub fn index_present(schema: &TableSchema, index: &IndexDef, existing: &[IndexMeta]) -> Result<bool> {
        let Some(found) = existing.iter().find(|i| i.name == index.name) else {
            return Ok(false);
        };
        if found.column.as_deref() != Some(index.column) {
            return Err(Error::SchemaConflict {
                object: format!("{}.{}", schema.keyspace, index.name),
                detail: format!("index targets {:?}, expected '{}'", found.column, index.column),
            });
        }
        Ok(true)
    }

    /// Describes how an existing table differs from the declared one, if at all.
    pub fn diff_table(expected: &TableSchema, actual: &TableDescription) -> Option<String> {
        let expected_pk = expected.partition_keys();
        if actual.partition_keys != expected_pk {
            return Some(format!(
                "partition key is {:?}, expected {:?}",
                actual.partition_keys, expected_pk
            ));
        }
        let expected_ck = expected.clustering_keys();
        if actual.clustering_keys != expected_ck {
            return Some(format!(
                "clustering key is {:?}, expected {:?}",
                actual.clustering_keys, expected_ck
            ));
        }
        for col in &expected.columns {
            let Some(found) = actual.columns.iter().find(|c| c.column_name == col.name) else {
                return Some(format!("missing column '{}'", col.name));
            };
            if ColumnType::from_cql_name(&found.r#type) != Some(col.ty) {
                return Some(format!(
                    "column '{}' is {}, expected {}",
                    col.name,
                    found.r#type,
                    col.ty.cql_name()
                ));
            }
        }
        actual
            .columns
            .iter()
            .find(|c| expected.column(&c.column_name).is_none())
            .map(|extra| format!("unexpected column '{}'", extra.column_name))
    }

    /// Describes how an existing keyspace differs from the declared one, if at all.
    pub fn diff_keyspace(expected: &KeyspaceSpec, actual: &KeyspaceDescription) -> Option<String> {
        let class = actual
            .replication
            .get("class")
            .map(|c| c.rsplit('.').next().unwrap_or(c))
            .unwrap_or_default();
        if class != expected.replication.class_name() {
            return Some(format!(
                "replication class is {}, expected {}",
                class,
                expected.replication.class_name()
            ));
        }
        let factor = |key: &str| actual.replication.get(key).and_then(|v| v.parse::<u32>().ok());
        match &expected.replication {
            ReplicationSpec::Simple { replication_factor } => {
                if factor("replication_factor") != Some(*replication_factor) {
                    return Some(format!(
                        "replication_factor is {:?}, expected {}",
                        actual.replication.get("replication_factor"),
                        replication_factor
                    ));
                }
            }
            ReplicationSpec::NetworkTopology { datacenters } => {
                let actual_dcs: BTreeMap<&str, Option<u32>> = actual
                    .replication
                    .keys()
                    .filter(|k| k.as_str() != "class")
                    .map(|k| (k.as_str(), factor(k.as_str())))
                    .collect();
                let expected_dcs: BTreeMap<&str, Option<u32>> = datacenters
                    .iter()
                    .map(|(dc, rf)| (dc.as_str(), Some(*rf)))
                    .collect();
                if actual_dcs != expected_dcs {
                    return Some(format!(
                        "datacenters are {:?}, expected {:?}",
                        actual_dcs, expected_dcs
                    ));
                }
            }
        }
        if actual.durable_writes != expected.durable_writes {
            return Some(format!(
                "durable_writes is {}, expected {}",
                actual.durable_writes, expected.durable_writes
            ));
        }
        None
    }

    /// Idempotent DDL over one connection.
    #[derive(Clone)]
    pub struct SchemaManager {
        conn: Connection,
    }

    impl SchemaManager {
        pub fn new(conn: Connection) -> Self {
            Self { conn }
        }

        async fn execute(&self, cql: String) -> Result<()> {
            debug!(%cql, "executing schema statement");
            self.conn
                .session()
                .query_unpaged(cql.as_str(), &[])
                .await
                .map_err(|source| Error::Statement {
                    statement: cql.clone(),
                    source,
                })?;
            self.conn.await_schema_agreement().await
        }

        pub async fn keyspace_exists(&self, keyspace: &str) -> Result<bool> {
            Ok(catalog::describe_keyspace_with(self.conn.session(), keyspace)
                .await?
                .is_some())
        }

        pub async fn table_exists(&self, keyspace: &str, table: &str) -> Result<bool> {
            Ok(catalog::describe_table_with(self.conn.session(), keyspace, table)
                .await?
                .is_some())
        }

        pub async fn ensure_keyspace(&self, spec: &KeyspaceSpec) -> Result<()> {
            let cql = spec.create_cql()?;
            let existing = catalog::describe_keyspace_with(self.conn.session(), &spec.name).await?;
            let current = match existing {
                Some(found) => found,
                None => {
                    info!(keyspace = %spec.name, class = spec.replication.class_name(), "creating keyspace");
                    self.execute(cql).await?;
                    catalog::describe_keyspace_with(self.conn.session(), &spec.name)
                        .await?
                        .ok_or_else(|| {
                            Error::NotReady(format!("keyspace '{}' not visible after creation", spec.name))
                        })?
                }
            };
            if let Some(detail) = diff_keyspace(spec, &current) {
                return Err(Error::SchemaConflict {
                    object: spec.name.clone(),
                    detail,
                });
            }
            Ok(())
        }

        pub async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
            let cql = schema.create_cql()?;
            let session = self.conn.session();
            let current = match catalog::describe_table_with(session, &schema.keyspace, &schema.table).await? {
                Some(found) => found,
                None => {
                    info!(table = %schema.qualified_name(), "creating table");
                    self.execute(cql).await?;
                    catalog::describe_table_with(session, &schema.keyspace, &schema.table)
                        .await?
                        .ok_or_else(|| {
                            Error::NotReady(format!(
                                "table '{}' not visible after creation",
                                schema.qualified_name()
                            ))
                        })?
                }
            };
            if let Some(detail) = diff_table(schema, &current) {
                return Err(Error::SchemaConflict {
                    object: schema.qualified_name(),
                    detail,
                });
            }
            Ok(())
        }

        pub async fn ensure_index(&self, schema: &TableSchema, index: &IndexDef) -> Result<()> {
            require_ident(index.name)?;
            if schema.column(index.column).is_none() {
                return Err(Error::SchemaConflict {
                    object: schema.qualified_name(),
                    detail: format!("index '{}' targets unknown column '{}'", index.name, index.column),
                });
            }
            let session = self.conn.session();
            let existing = catalog::list_indexes_with(session, &schema.keyspace, &schema.table).await?;
            if index_present(schema, index, &existing)? {
                return Ok(());
            }
            info!(table = %schema.qualified_name(), index = index.name, column = index.column, "creating index");
            self.execute(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                index.name,
                schema.qualified_name(),
                index.column
            ))
            .await?;
            // IF NOT EXISTS is a silent no-op when the name is taken by another table.
            let created = catalog::list_indexes_with(session, &schema.keyspace, &schema.table).await?;
            if !index_present(schema, index, &created)? {
                return Err(Error::SchemaConflict {
                    object: format!("{}.{}", schema.keyspace, index.name),
                    detail: "index name already used elsewhere in the keyspace".into(),
                });
            }
            Ok(())
        }

        pub async fn drop_table(&self, keyspace: &str, table: &str) -> Result<()> {
            let cql = format!(
                "DROP TABLE IF EXISTS {}.{}",
                require_ident(keyspace)?,
                require_ident(table)?
            );
            info!(%keyspace, %table, "dropping table");
            self.execute(cql).await
        }

        pub async fn apply(
            &self,
            action: SchemaAction,
            keyspace: &KeyspaceSpec,
            schema: &TableSchema,
            indexes: &[IndexDef],
        ) -> Result<()> {
            let span = info_span!(
                "schema_apply",
                ?action,
                keyspace = %keyspace.name,
                table = %schema.table
            );
            self.apply_inner(action, keyspace, schema, indexes)
                .instrument(span)
                .await
        }

        async fn apply_inner(
            &self,
            action: SchemaAction,
            keyspace: &KeyspaceSpec,
            schema: &TableSchema,
            indexes: &[IndexDef],
        ) -> Result<()> {
            match action {
                SchemaAction::None => {
                    if !self.keyspace_exists(&keyspace.name).await? {
                        return Err(Error::NotReady(format!(
                            "keyspace '{}' does not exist",
                            keyspace.name
                        )));
                    }
                    if !self.table_exists(&schema.keyspace, &schema.table).await? {
                        return Err(Error::NotReady(format!(
                            "table '{}' does not exist",
                            schema.qualified_name()
                        )));
                    }
                    return Ok(());
                }
                SchemaAction::CreateIfNotExists => {
                    self.ensure_keyspace(keyspace).await?;
                }
                SchemaAction::Recreate => {
                    self.ensure_keyspace(keyspace).await?;
                    self.drop_table(&schema.keyspace, &schema.table).await?;
                }
            }
            self.ensure_table(schema).await?;
            for index in indexes {
                self.ensure_index(schema, index).await?;
            }
            Ok(())
        }
    }
}

pub mod catalog {
    use std::collections::BTreeMap;

    use scylla_cql::frame::response::result::{CqlValue, Row};
    use serde::Serialize;

    use crate::error::{Error, Result};

    #[derive(Debug, Serialize, Clone, PartialEq, Eq)]
    pub struct KeyspaceDescription {
        pub name: String,
        pub replication: BTreeMap<String, String>,
        pub durable_writes: bool,
    }

    #[derive(Debug, Serialize, Clone, PartialEq, Eq)]
    pub struct ColumnMeta {
        pub column_name: String,
        pub kind: String,
        pub position: i32,
        pub r#type: String,
    }

    #[derive(Debug, Serialize, Clone, PartialEq, Eq)]
    pub struct TableDescription {
        pub keyspace: String,
        pub table: String,
        pub partition_keys: Vec<String>,
        pub clustering_keys: Vec<String>,
        pub columns: Vec<ColumnMeta>,
    }

    impl TableDescription {
        /// Builds a description from column metadata, ordering key columns by position.
        pub fn from_columns(keyspace: &str, table: &str, columns: Vec<ColumnMeta>) -> Self {
            let keys_of = |kind: &str| {
                let mut keyed: Vec<(i32, String)> = columns
                    .iter()
                    .filter(|c| c.kind == kind)
                    .map(|c| (c.position, c.column_name.clone()))
                    .collect();
                keyed.sort_by_key(|(pos, _)| *pos);
                keyed.into_iter().map(|(_, n)| n).collect::<Vec<_>>()
            };
            Self {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                partition_keys: keys_of("partition_key"),
                clustering_keys: keys_of("clustering"),
                columns,
            }
        }
    }

    #[derive(Debug, Serialize, Clone, PartialEq, Eq)]
    pub struct IndexMeta {
        pub name: String,
        /// Indexed column parsed from the index `target` option.
        pub column: Option<String>,
    }

    fn text(v: &CqlValue) -> Option<String> {
        match v {
            CqlValue::Ascii(s) | CqlValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn text_at(row: &Row, idx: usize) -> Option<String> {
        row.columns.get(idx).and_then(|o| o.as_ref()).and_then(text)
    }

    fn text_map_at(row: &Row, idx: usize) -> BTreeMap<String, String> {
        match row.columns.get(idx).and_then(|o| o.as_ref()) {
            Some(CqlValue::Map(entries)) => entries
                .iter()
                .filter_map(|(k, v)| Some((text(k)?, text(v)?)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    fn read_err(target: &str) -> impl FnOnce(scylla::transport::errors::QueryError) -> Error + '_ {
        move |source| Error::Read {
            target: target.to_string(),
            source,
        }
    }

    /// Column name an index target refers to: strips quoting and wrappers
    /// such as `values(col)` or `keys(col)`.
    pub fn index_target_column(target: &str) -> String {
        let inner = match (target.find('('), target.rfind(')')) {
            (Some(open), Some(close)) if open < close => &target[open + 1..close],
            _ => target,
        };
        inner.trim().trim_matches('"').to_string()
    }

    pub async fn describe_keyspace_with(
        session: &scylla::Session,
        keyspace: &str,
    ) -> Result<Option<KeyspaceDescription>> {
        let result = session
            .query_unpaged(
                "SELECT replication, durable_writes FROM system_schema.keyspaces WHERE keyspace_name = ?",
                (keyspace.to_string(),),
            )
            .await
            .map_err(read_err("system_schema.keyspaces"))?;
        let rows = result.rows_or_empty();
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let durable_writes = matches!(
            row.columns.get(1).and_then(|o| o.as_ref()),
            Some(CqlValue::Boolean(true))
        );
        Ok(Some(KeyspaceDescription {
            name: keyspace.to_string(),
            replication: text_map_at(row, 0),
            durable_writes,
        }))
    }

    pub async fn describe_table_with(
        session: &scylla::Session,
        keyspace: &str,
        table: &str,
    ) -> Result<Option<TableDescription>> {
        let result = session
            .query_unpaged(
                "SELECT column_name, kind, position, type FROM system_schema.columns WHERE keyspace_name = ? AND table_name = ?",
                (keyspace.to_string(), table.to_string()),
            )
            .await
            .map_err(read_err("system_schema.columns"))?;
        let rows = result.rows_or_empty();
        if rows.is_empty() {
            return Ok(None);
        }
        let cols = rows
            .iter()
            .map(|row| ColumnMeta {
                column_name: text_at(row, 0).unwrap_or_default(),
                kind: text_at(row, 1).unwrap_or_default(),
                position: match row.columns.get(2).and_then(|o| o.as_ref()) {
                    Some(CqlValue::Int(i)) => *i,
                    _ => 0,
                },
                r#type: text_at(row, 3).unwrap_or_default(),
            })
            .collect();
        Ok(Some(TableDescription::from_columns(keyspace, table, cols)))
    }

    pub async fn list_indexes_with(
        session: &scylla::Session,
        keyspace: &str,
        table: &str,
    ) -> Result<Vec<IndexMeta>> {
        let result = session
            .query_unpaged(
                "SELECT index_name, options FROM system_schema.indexes WHERE keyspace_name = ? AND table_name = ?",
                (keyspace.to_string(), table.to_string()),
            )
            .await
            .map_err(read_err("system_schema.indexes"))?;
        Ok(result
            .rows_or_empty()
            .iter()
            .filter_map(|row| {
                let name = text_at(row, 0)?;
                let column = text_map_at(row, 1)
                    .get("target")
                    .map(|t| index_target_column(t.as_str()));
                Some(IndexMeta { name, column })
            })
            .collect())
    }

    /// Names of materialized views over `table` whose sole partition key is `column`.
    pub async fn views_keyed_on_with(
        session: &scylla::Session,
        keyspace: &str,
        table: &str,
        column: &str,
    ) -> Result<Vec<String>> {
        let result = session
            .query_unpaged(
                "SELECT view_name, base_table_name FROM system_schema.views WHERE keyspace_name = ?",
                (keyspace.to_string(),),
            )
            .await
            .map_err(read_err("system_schema.views"))?;
        let mut out = Vec::new();
        for row in result.rows_or_empty().iter() {
            let (Some(view), Some(base)) = (text_at(row, 0), text_at(row, 1)) else {
                continue;
            };
            if base != table {
                continue;
            }
            if let Some(desc) = describe_table_with(session, keyspace, &view).await? {
                if desc.partition_keys == [column] {
                    out.push(view);
                }
            }
        }
        Ok(out)
    }
}

pub mod codec {
    use std::collections::BTreeMap;

    use scylla_cql::frame::response::result::{CqlValue, Row};

    use crate::error::{Error, Result};
    use crate::schema::{ColumnDef, ColumnKind, IndexDef};

    pub fn cql_type_name(v: &CqlValue) -> &'static str {
        match v {
            CqlValue::Ascii(_) => "ascii",
            CqlValue::Text(_) => "text",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Int(_) => "int",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Float(_) => "float",
            CqlValue::Double(_) => "double",
            CqlValue::Decimal(_) => "decimal",
            CqlValue::Blob(_) => "blob",
            CqlValue::Uuid(_) => "uuid",
            CqlValue::List(_) => "list",
            CqlValue::Set(_) => "set",
            CqlValue::Map(_) => "map",
            _ => "other",
        }
    }

    /// A row as a map of column name to non-null value.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Record {
        values: BTreeMap<String, CqlValue>,
    }

    impl Record {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, column: &str, value: CqlValue) -> Self {
            self.insert(column, value);
            self
        }

        pub fn insert(&mut self, column: &str, value: CqlValue) {
            self.values.insert(column.to_string(), value);
        }

        pub fn get(&self, column: &str) -> Option<&CqlValue> {
            self.values.get(column)
        }

        pub fn columns(&self) -> impl Iterator<Item = &str> {
            self.values.keys().map(String::as_str)
        }

        pub fn len(&self) -> usize {
            self.values.len()
        }

        pub fn is_empty(&self) -> bool {
            self.values.is_empty()
        }

        /// Pairs a driver row with the columns it was selected with, in order.
        /// Null cells are left out.
        pub fn from_row(columns: &[ColumnDef], row: Row) -> Self {
            let values = columns
                .iter()
                .zip(row.columns)
                .filter_map(|(col, cell)| cell.map(|v| (col.name.to_string(), v)))
                .collect();
            Self { values }
        }

        /// Values in declaration order, ready to bind to a prepared statement.
        pub fn bind_values(&self, columns: &[ColumnDef]) -> Result<Vec<CqlValue>> {
            columns
                .iter()
                .map(|col| {
                    self.values
                        .get(col.name)
                        .cloned()
                        .ok_or_else(|| Error::codec(col.name, "missing required column"))
                })
                .collect()
        }

        fn require(&self, column: &str) -> Result<&CqlValue> {
            self.values
                .get(column)
                .ok_or_else(|| Error::codec(column, "missing required column"))
        }

        pub fn text(&self, column: &str) -> Result<String> {
            match self.require(column)? {
                CqlValue::Text(s) | CqlValue::Ascii(s) => Ok(s.clone()),
                other => Err(Error::codec(
                    column,
                    format!("expected text, found {}", cql_type_name(other)),
                )),
            }
        }

        /// Reads a `float` column; a `double` is accepted when it fits in `f32`
        /// without overflowing or flushing a non-zero value to zero.
        pub fn float(&self, column: &str) -> Result<f32> {
            match self.require(column)? {
                CqlValue::Float(f) => Ok(*f),
                CqlValue::Double(d) => {
                    let narrowed = *d as f32;
                    let overflows = d.is_finite() && d.abs() > f32::MAX as f64;
                    let underflows = *d != 0.0 && narrowed == 0.0;
                    if overflows || underflows {
                        return Err(Error::codec(
                            column,
                            format!("value {} outside float range", d),
                        ));
                    }
                    Ok(narrowed)
                }
                other => Err(Error::codec(
                    column,
                    format!("expected float, found {}", cql_type_name(other)),
                )),
            }
        }

        /// Reads a `bigint` column; an `int` widens losslessly.
        pub fn bigint(&self, column: &str) -> Result<i64> {
            match self.require(column)? {
                CqlValue::BigInt(n) => Ok(*n),
                CqlValue::Int(n) => Ok(i64::from(*n)),
                other => Err(Error::codec(
                    column,
                    format!("expected bigint, found {}", cql_type_name(other)),
                )),
            }
        }

        pub fn double(&self, column: &str) -> Result<f64> {
            match self.require(column)? {
                CqlValue::Double(d) => Ok(*d),
                CqlValue::Float(f) => Ok(*f as f64),
                other => Err(Error::codec(
                    column,
                    format!("expected double, found {}", cql_type_name(other)),
                )),
            }
        }
    }

    /// Static mapping between a domain type and one table.
    pub trait Entity: Sized + Send + Sync + 'static {
        type Key: Clone + Send + Sync + 'static;

        const TABLE: &'static str;

        fn columns() -> &'static [ColumnDef];

        /// Secondary indexes the schema manager creates alongside the table.
        fn indexes() -> &'static [IndexDef] {
            &[]
        }

        fn key_column() -> &'static str {
            Self::columns()
                .iter()
                .find(|c| c.kind == ColumnKind::PartitionKey)
                .map(|c| c.name)
                .unwrap_or_default()
        }

        fn key(&self) -> Self::Key;

        fn key_value(key: &Self::Key) -> CqlValue;

        fn encode(&self) -> Result<Record>;

        fn decode(record: &Record) -> Result<Self>;
    }
}

pub mod connection {
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;

    use openssl::ssl::{SslContext, SslMethod, SslVerifyMode};
    use scylla::transport::execution_profile::ExecutionProfile;
    use scylla::{Session, SessionBuilder};
    use tokio::time::{sleep, timeout};
    use tracing::{debug, info, warn};

    use crate::config::{ClientConfig, ConnectOptions};
    use crate::error::{Error, Result};

    /// Shared handle to a pooled session; the pool closes when the last clone drops.
    #[derive(Clone)]
    pub struct Connection {
        inner: Arc<Inner>,
    }

    struct Inner {
        session: Session,
        contact_points: Vec<String>,
    }

    impl Drop for Inner {
        fn drop(&mut self) {
            debug!(contact_points = ?self.contact_points, "releasing connection pool");
        }
    }

    impl Connection {
        pub fn session(&self) -> &Session {
            &self.inner.session
        }

        pub fn contact_points(&self) -> &[String] {
            &self.inner.contact_points
        }

        pub async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
            crate::schema::require_ident(keyspace)?;
            self.inner
                .session
                .use_keyspace(keyspace, false)
                .await
                .map_err(|source| Error::Statement {
                    statement: format!("USE {};", keyspace),
                    source,
                })
        }

        pub async fn await_schema_agreement(&self) -> Result<()> {
            self.inner
                .session
                .await_schema_agreement()
                .await
                .map(|_| ())
                .map_err(|source| Error::Statement {
                    statement: "await schema agreement".into(),
                    source,
                })
        }

        /// Drops this handle; the pool is released once no clones remain.
        pub fn close(self) {
            debug!(
                remaining = Arc::strong_count(&self.inner) - 1,
                "closing connection handle"
            );
        }
    }

    /// Normalizes a contact point to `host:port`.
    pub fn resolve_contact_point(contact_point: &str, port: u16) -> String {
        let cp = contact_point.trim();
        if cp.parse::<SocketAddr>().is_ok() {
            return cp.to_string();
        }
        if let Ok(ip) = cp.parse::<IpAddr>() {
            return SocketAddr::new(ip, port).to_string();
        }
        match cp.rsplit_once(':') {
            Some((host, p)) if !host.is_empty() && p.parse::<u16>().is_ok() => cp.to_string(),
            _ => format!("{}:{}", cp, port),
        }
    }

    fn ssl_context(config: &ClientConfig) -> Result<SslContext> {
        let tls_err = |e: openssl::error::ErrorStack| Error::Config(format!("tls: {}", e));
        let mut ctx = SslContext::builder(SslMethod::tls()).map_err(tls_err)?;
        if let Some(ca_file) = &config.tls.ca_bundle {
            ctx.set_ca_file(ca_file).map_err(tls_err)?;
        }
        ctx.set_verify(if config.tls.insecure {
            SslVerifyMode::NONE
        } else {
            SslVerifyMode::PEER
        });
        Ok(ctx.build())
    }

    fn session_builder(config: &ClientConfig, nodes: &[String]) -> Result<SessionBuilder> {
        let profile = ExecutionProfile::builder()
            .consistency(config.consistency.into())
            .request_timeout(Some(config.request_timeout()))
            .build();
        let mut sb = SessionBuilder::new()
            .known_nodes(nodes)
            .connection_timeout(config.connect.connect_timeout())
            .default_execution_profile_handle(profile.into_handle());
        if let (Some(user), Some(pass)) = (&config.user, &config.password) {
            sb = sb.user(user, pass);
        }
        if config.tls.enabled {
            sb = sb.ssl_context(Some(ssl_context(config)?));
        }
        Ok(sb)
    }

    pub async fn connect(
        contact_points: &[String],
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let config = ClientConfig {
            contact_points: contact_points.to_vec(),
            port,
            connect: options.clone(),
            ..ClientConfig::default()
        };
        connect_with_config(&config).await
    }

    pub async fn connect_with_config(config: &ClientConfig) -> Result<Connection> {
        let nodes: Vec<String> = config
            .contact_points
            .iter()
            .map(|cp| resolve_contact_point(cp, config.port))
            .collect();
        let attempts = config.connect.attempts.max(1);
        if nodes.is_empty() {
            return Err(Error::Connection {
                contact_points: nodes,
                attempts: 0,
                reason: "no contact points given".into(),
            });
        }
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            info!(nodes = ?nodes, attempt, "connecting to scylla");
            let builder = session_builder(config, &nodes)?;
            match timeout(config.connect.connect_timeout(), builder.build()).await {
                Ok(Ok(session)) => {
                    info!(nodes = ?nodes, "connected");
                    return Ok(Connection {
                        inner: Arc::new(Inner {
                            session,
                            contact_points: nodes,
                        }),
                    });
                }
                Ok(Err(err)) => last_err = err.to_string(),
                Err(_) => {
                    last_err = format!(
                        "attempt timed out after {:?}",
                        config.connect.connect_timeout()
                    )
                }
            }
            warn!(attempt, attempts, error = %last_err, "connection attempt failed");
            if attempt < attempts {
                sleep(config.connect.backoff_after(attempt)).await;
            }
        }
        Err(Error::Connection {
            contact_points: nodes,
            attempts,
            reason: last_err,
        })
    }
}

pub mod repository {
    use std::collections::HashMap;
    use std::marker::PhantomData;
    use std::sync::Arc;

    use base64::Engine;
    use futures_util::stream::{Stream, StreamExt, TryStreamExt};
    use scylla::query::Query;
    use scylla::statement::prepared_statement::PreparedStatement;
    use scylla::statement::{PagingState, PagingStateResponse};
    use scylla_cql::frame::response::result::CqlValue;
    use tokio::sync::RwLock;
    use tracing::{debug, info_span, Instrument};

    use crate::catalog;
    use crate::codec::{Entity, Record};
    use crate::config::{ClientConfig, SchemaAction};
    use crate::connection::Connection;
    use crate::error::{Error, Result};
    use crate::schema::{require_ident, KeyspaceSpec, SchemaManager, TableSchema};

    struct Statements {
        insert: PreparedStatement,
        select_by_key: PreparedStatement,
        delete_by_key: PreparedStatement,
        count: PreparedStatement,
    }

    /// Typed access to the table backing `E`.
    pub struct Repository<E: Entity> {
        conn: Connection,
        schema: Arc<TableSchema>,
        statements: Arc<Statements>,
        lookups: Arc<RwLock<HashMap<String, PreparedStatement>>>,
        _entity: PhantomData<fn() -> E>,
    }

    impl<E: Entity> Clone for Repository<E> {
        fn clone(&self) -> Self {
            Self {
                conn: self.conn.clone(),
                schema: self.schema.clone(),
                statements: self.statements.clone(),
                lookups: self.lookups.clone(),
                _entity: PhantomData,
            }
        }
    }

    /// A page of entities plus an opaque cursor for the next one.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Page<E> {
        pub items: Vec<E>,
        pub next_cursor: Option<String>,
    }

    impl<E: Entity> Repository<E> {
        pub async fn open(
            conn: Connection,
            keyspace: &KeyspaceSpec,
            action: SchemaAction,
        ) -> Result<Self> {
            let schema = TableSchema::for_entity::<E>(&keyspace.name);
            SchemaManager::new(conn.clone())
                .apply(action, keyspace, &schema, E::indexes())
                .await?;
            let statements = Self::prepare_all(&conn, &schema).await?;
            debug!(table = %schema.qualified_name(), "repository ready");
            Ok(Self {
                conn,
                schema: Arc::new(schema),
                statements: Arc::new(statements),
                lookups: Arc::new(RwLock::new(HashMap::new())),
                _entity: PhantomData,
            })
        }

        pub async fn open_with_config(conn: Connection, config: &ClientConfig) -> Result<Self> {
            Self::open(conn, &config.keyspace, config.schema_action).await
        }

        async fn prepare(conn: &Connection, cql: String) -> Result<PreparedStatement> {
            conn.session()
                .prepare(cql.as_str())
                .await
                .map_err(|source| Error::Statement {
                    statement: cql,
                    source,
                })
        }

        async fn prepare_all(conn: &Connection, schema: &TableSchema) -> Result<Statements> {
            let table = schema.qualified_name();
            let key = E::key_column();
            let cols = schema.column_list();
            let marks = vec!["?"; schema.columns.len()].join(", ");
            Ok(Statements {
                insert: Self::prepare(
                    conn,
                    format!("INSERT INTO {} ({}) VALUES ({})", table, cols, marks),
                )
                .await?,
                select_by_key: Self::prepare(
                    conn,
                    format!("SELECT {} FROM {} WHERE {} = ?", cols, table, key),
                )
                .await?,
                delete_by_key: Self::prepare(
                    conn,
                    format!("DELETE FROM {} WHERE {} = ?", table, key),
                )
                .await?,
                count: Self::prepare(conn, format!("SELECT COUNT(*) FROM {}", table)).await?,
            })
        }

        pub fn schema(&self) -> &TableSchema {
            &self.schema
        }

        fn write_err(&self) -> impl FnOnce(scylla::transport::errors::QueryError) -> Error + '_ {
            move |source| Error::Write {
                table: self.schema.qualified_name(),
                source,
            }
        }

        fn read_err(&self) -> impl FnOnce(scylla::transport::errors::QueryError) -> Error + '_ {
            move |source| Error::Read {
                target: self.schema.qualified_name(),
                source,
            }
        }

        /// Inserts or overwrites the row keyed by `entity.key()`.
        pub async fn save(&self, entity: &E) -> Result<()> {
            let record = entity.encode()?;
            let span = info_span!(
                "save",
                keyspace = %self.schema.keyspace,
                table = %self.schema.table,
                key = ?record.get(E::key_column())
            );
            self.write_record(&record).instrument(span).await
        }

        async fn write_record(&self, record: &Record) -> Result<()> {
            let values = record.bind_values(&self.schema.columns)?;
            self.conn
                .session()
                .execute_unpaged(&self.statements.insert, &values[..])
                .await
                .map_err(self.write_err())?;
            debug!("saved entity");
            Ok(())
        }

        pub fn find_by_key(&self, key: impl Into<E::Key>) -> KeyLookup<E> {
            let key = key.into();
            self.lookup(self.statements.select_by_key.clone(), E::key_value(&key))
        }

        pub async fn exists(&self, key: impl Into<E::Key>) -> Result<bool> {
            Ok(self.find_by_key(key).first().await?.is_some())
        }

        pub async fn delete(&self, key: impl Into<E::Key>) -> Result<()> {
            let key = key.into();
            self.conn
                .session()
                .execute_unpaged(&self.statements.delete_by_key, (E::key_value(&key),))
                .await
                .map_err(self.write_err())?;
            Ok(())
        }

        pub async fn count(&self) -> Result<i64> {
            let result = self
                .conn
                .session()
                .execute_unpaged(&self.statements.count, &[])
                .await
                .map_err(self.read_err())?;
            let cell = result
                .rows_or_empty()
                .into_iter()
                .next()
                .and_then(|row| row.columns.into_iter().next().flatten());
            let mut record = Record::new();
            if let Some(value) = cell {
                record.insert("count", value);
            }
            record.bigint("count")
        }

        /// Lookup by a non-key column. Needs a declared index present in the
        /// catalog or a materialized view partitioned by that column.
        pub async fn find_by(&self, column: &str, value: CqlValue) -> Result<KeyLookup<E>> {
            require_ident(column)?;
            if column == E::key_column() {
                return Ok(self.lookup(self.statements.select_by_key.clone(), value));
            }
            if let Some(stmt) = self.lookups.read().await.get(column).cloned() {
                return Ok(self.lookup(stmt, value));
            }
            let unsupported = || Error::QueryNotSupported {
                table: self.schema.qualified_name(),
                column: column.to_string(),
            };
            if self.schema.column(column).is_none() {
                return Err(unsupported());
            }
            let session = self.conn.session();
            let ks = &self.schema.keyspace;
            let declared = E::indexes().iter().any(|i| i.column == column);
            let indexed = declared
                && catalog::list_indexes_with(session, ks, &self.schema.table)
                    .await?
                    .iter()
                    .any(|i| i.column.as_deref() == Some(column));
            let source = if indexed {
                self.schema.table.clone()
            } else {
                catalog::views_keyed_on_with(session, ks, &self.schema.table, column)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(unsupported)?
            };
            let stmt = Self::prepare(
                &self.conn,
                format!(
                    "SELECT {} FROM {}.{} WHERE {} = ?",
                    self.schema.column_list(),
                    ks,
                    source,
                    column
                ),
            )
            .await?;
            debug!(%column, %source, "prepared secondary lookup");
            self.lookups
                .write()
                .await
                .insert(column.to_string(), stmt.clone());
            Ok(self.lookup(stmt, value))
        }

        fn lookup(&self, statement: PreparedStatement, value: CqlValue) -> KeyLookup<E> {
            KeyLookup {
                conn: self.conn.clone(),
                schema: self.schema.clone(),
                statement,
                values: vec![value],
                _entity: PhantomData,
            }
        }

        /// One page of the whole table in storage order.
        pub async fn find_all_paged(&self, page_size: i32, cursor: Option<&str>) -> Result<Page<E>> {
            if page_size < 1 {
                return Err(Error::Config("page_size must be at least 1".into()));
            }
            let cql = format!(
                "SELECT {} FROM {}",
                self.schema.column_list(),
                self.schema.qualified_name()
            );
            let prepared = self
                .conn
                .session()
                .prepare(Query::new(cql.clone()).with_page_size(page_size))
                .await
                .map_err(|source| Error::Statement {
                    statement: cql,
                    source,
                })?;
            let paging_state = match cursor {
                Some(tok) => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(tok.as_bytes())
                        .map_err(|e| Error::InvalidCursor(e.to_string()))?;
                    PagingState::new_from_raw_bytes(bytes)
                }
                None => PagingState::start(),
            };
            let (result, paging_resp) = self
                .conn
                .session()
                .execute_single_page(&prepared, &[], paging_state)
                .await
                .map_err(self.read_err())?;
            let items = result
                .rows_or_empty()
                .into_iter()
                .map(|row| E::decode(&Record::from_row(&self.schema.columns, row)))
                .collect::<Result<Vec<_>>>()?;
            let next_cursor = match paging_resp {
                PagingStateResponse::HasMorePages { state } => state.as_bytes_slice().map(|arc| {
                    let slice: &[u8] = arc.as_ref();
                    base64::engine::general_purpose::STANDARD.encode(slice)
                }),
                PagingStateResponse::NoMorePages => None,
            };
            Ok(Page { items, next_cursor })
        }
    }

    /// Lazy, restartable result of a keyed lookup. Nothing is sent to the
    /// node until `stream` (or a helper built on it) is called, and every call
    /// runs the query again.
    pub struct KeyLookup<E: Entity> {
        conn: Connection,
        schema: Arc<TableSchema>,
        statement: PreparedStatement,
        values: Vec<CqlValue>,
        _entity: PhantomData<fn() -> E>,
    }

    impl<E: Entity> KeyLookup<E> {
        pub async fn stream(&self) -> Result<impl Stream<Item = Result<E>> + Send + 'static> {
            let target = self.schema.qualified_name();
            let span = info_span!("lookup", table = %target, key = ?self.values);
            let rows = self
                .conn
                .session()
                .execute_iter(self.statement.clone(), self.values.clone())
                .instrument(span)
                .await
                .map_err(|source| Error::Read {
                    target: target.clone(),
                    source,
                })?;
            let schema = self.schema.clone();
            Ok(rows.map(move |row| {
                let row = row.map_err(|source| Error::Read {
                    target: target.clone(),
                    source,
                })?;
                E::decode(&Record::from_row(&schema.columns, row))
            }))
        }

        pub async fn collect(&self) -> Result<Vec<E>> {
            let mut stream = std::pin::pin!(self.stream().await?);
            let mut out = Vec::new();
            while let Some(entity) = stream.try_next().await? {
                out.push(entity);
            }
            Ok(out)
        }

        pub async fn first(&self) -> Result<Option<E>> {
            let mut stream = std::pin::pin!(self.stream().await?);
            stream.try_next().await
        }
    }
}

pub mod harness {
    use std::fs::File;
    use std::net::{SocketAddr, TcpListener};
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::time::Duration;

    use serde::Deserialize;
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio::process::{Child, Command};
    use tokio::time::{sleep, timeout, Instant};
    use tracing::{info, info_span, warn, Instrument};

    use crate::config::{ClientConfig, ConnectOptions};
    use crate::connection::{self, Connection};
    use crate::error::{Error, Result};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum NodeState {
        Stopped,
        Starting,
        Ready,
        Stopping,
    }

    /// How to launch a local node. `{port}` and `{data_dir}` in `args`,
    /// `env` values and `stop_command` are replaced before spawning.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct NodeConfig {
        pub program: String,
        pub args: Vec<String>,
        pub env: Vec<(String, String)>,
        /// Run on teardown before the child is killed.
        pub stop_command: Option<Vec<String>>,
        pub host: String,
        /// 0 picks a free port.
        pub port: u16,
        pub startup_timeout_ms: u64,
        pub poll_interval_ms: u64,
    }

    impl Default for NodeConfig {
        fn default() -> Self {
            Self::docker_scylla(0)
        }
    }

    impl NodeConfig {
        pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
            Self {
                program: program.into(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: Vec::new(),
                stop_command: None,
                host: "127.0.0.1".into(),
                port: 0,
                startup_timeout_ms: 120_000,
                poll_interval_ms: 250,
            }
        }

        /// Single developer-mode ScyllaDB container publishing CQL on `port`.
        pub fn docker_scylla(port: u16) -> Self {
            let mut cfg = Self::command(
                "docker",
                &[
                    "run",
                    "--rm",
                    "--name",
                    "scylla-rust-repo-{port}",
                    "-p",
                    "{port}:9042",
                    "scylladb/scylla",
                    "--smp",
                    "1",
                    "--memory",
                    "750M",
                    "--overprovisioned",
                    "1",
                    "--developer-mode",
                    "1",
                ],
            );
            cfg.port = port;
            cfg.stop_command = Some(vec![
                "docker".into(),
                "rm".into(),
                "-f".into(),
                "scylla-rust-repo-{port}".into(),
            ]);
            cfg
        }

        pub fn startup_timeout(&self) -> Duration {
            Duration::from_millis(self.startup_timeout_ms)
        }

        pub fn poll_interval(&self) -> Duration {
            Duration::from_millis(self.poll_interval_ms.max(1))
        }
    }

    pub fn substitute(template: &str, port: u16, data_dir: &Path) -> String {
        template
            .replace("{port}", &port.to_string())
            .replace("{data_dir}", &data_dir.to_string_lossy())
    }

    /// Pick an available local port by binding to port 0.
    pub fn pick_free_port() -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }

    /// Polls until `addr` accepts a TCP connection; false once `limit` elapses.
    pub async fn wait_for_port(addr: SocketAddr, limit: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if let Ok(Ok(_)) = timeout(poll, TcpStream::connect(addr)).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(poll).await;
        }
    }

    fn tail(text: &str, lines: usize) -> String {
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// A locally launched node scoped to its owner. Dropping it kills the
    /// process and removes its temporary directory.
    pub struct EmbeddedNode {
        config: NodeConfig,
        state: NodeState,
        addr: SocketAddr,
        child: Option<Child>,
        data_dir: Option<TempDir>,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    }

    impl EmbeddedNode {
        pub async fn start(config: NodeConfig) -> Result<Self> {
            let host = config
                .host
                .parse()
                .map_err(|_| Error::Config(format!("invalid node host '{}'", config.host)))?;
            let mut node = Self {
                addr: SocketAddr::new(host, config.port),
                config,
                state: NodeState::Stopped,
                child: None,
                data_dir: None,
                stdout_path: PathBuf::new(),
                stderr_path: PathBuf::new(),
            };
            node.boot().await?;
            Ok(node)
        }

        async fn boot(&mut self) -> Result<()> {
            let span = info_span!(
                "node_boot",
                program = %self.config.program,
                host = %self.config.host,
                port = self.config.port
            );
            self.boot_inner().instrument(span).await
        }

        async fn boot_inner(&mut self) -> Result<()> {
            self.state = NodeState::Starting;
            if let Err(err) = self.spawn() {
                self.teardown().await;
                return Err(err);
            }
            info!(addr = %self.addr, program = %self.config.program, "waiting for node");
            match self.wait_ready().await {
                Ok(()) => {
                    self.state = NodeState::Ready;
                    info!(addr = %self.addr, "node ready");
                    Ok(())
                }
                Err(err) => {
                    warn!(addr = %self.addr, error = %err, "node failed to start");
                    self.teardown().await;
                    Err(err)
                }
            }
        }

        fn spawn(&mut self) -> Result<()> {
            let data_dir = tempfile::Builder::new().prefix("scylla-node-").tempdir()?;
            let port = if self.config.port == 0 {
                pick_free_port()?
            } else {
                self.config.port
            };
            self.addr.set_port(port);
            self.stdout_path = data_dir.path().join("node.out.log");
            self.stderr_path = data_dir.path().join("node.err.log");
            let stdout_file = File::create(&self.stdout_path)?;
            let stderr_file = File::create(&self.stderr_path)?;

            let dir = data_dir.path();
            let mut cmd = Command::new(&self.config.program);
            cmd.args(self.config.args.iter().map(|a| substitute(a, port, dir)))
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout_file))
                .stderr(Stdio::from(stderr_file))
                .kill_on_drop(true);
            for (k, v) in &self.config.env {
                cmd.env(k, substitute(v, port, dir));
            }
            self.child = Some(cmd.spawn()?);
            self.data_dir = Some(data_dir);
            Ok(())
        }

        async fn wait_ready(&mut self) -> Result<()> {
            let limit = self.config.startup_timeout();
            let poll = self.config.poll_interval();
            let deadline = Instant::now() + limit;
            let timed_out = |node: &Self, detail: String| Error::StartupTimeout {
                addr: node.addr,
                timeout: limit,
                detail,
            };
            loop {
                if let Some(child) = self.child.as_mut() {
                    match child.try_wait() {
                        Ok(None) => {}
                        Ok(Some(status)) => {
                            let stderr = tail(&self.read_stderr(), 20);
                            let detail = format!(
                                "process exited with {status} before accepting connections\n{stderr}"
                            );
                            return Err(timed_out(self, detail));
                        }
                        Err(err) => {
                            return Err(timed_out(self, format!("could not poll node process: {err}")));
                        }
                    }
                }
                if let Ok(Ok(_)) = timeout(poll, TcpStream::connect(self.addr)).await {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    let stderr = tail(&self.read_stderr(), 20);
                    return Err(timed_out(self, format!("port never opened\n{}", stderr)));
                }
                sleep(poll).await;
            }
        }

        fn stop_command(&self) -> Option<std::process::Command> {
            let argv = self.config.stop_command.as_ref()?;
            let dir = self.data_dir.as_ref().map(|d| d.path().to_path_buf()).unwrap_or_default();
            let mut parts = argv.iter().map(|a| substitute(a, self.addr.port(), &dir));
            let mut cmd = std::process::Command::new(parts.next()?);
            cmd.args(parts).stdout(Stdio::null()).stderr(Stdio::null());
            Some(cmd)
        }

        async fn teardown(&mut self) {
            if self.state != NodeState::Stopped {
                self.state = NodeState::Stopping;
            }
            if let Some(cmd) = self.stop_command() {
                if self.child.is_some() {
                    if let Err(err) = Command::from(cmd).status().await {
                        warn!(error = %err, "stop command failed");
                    }
                }
            }
            if let Some(mut child) = self.child.take() {
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "failed to kill node process");
                }
                if let Err(err) = child.wait().await {
                    warn!(error = %err, "failed to reap node process");
                }
            }
            if let Some(dir) = self.data_dir.take() {
                if let Err(err) = dir.close() {
                    warn!(error = %err, "failed to remove node data directory");
                }
            }
            self.state = NodeState::Stopped;
        }

        /// Stops the node; safe to call in any state.
        pub async fn stop(&mut self) {
            info!(addr = %self.addr, "stopping node");
            self.teardown().await;
        }

        pub fn state(&self) -> NodeState {
            self.state
        }

        pub fn ensure_ready(&self) -> Result<()> {
            if self.state == NodeState::Ready {
                Ok(())
            } else {
                Err(Error::NotReady(format!(
                    "node at {} is {:?}",
                    self.addr, self.state
                )))
            }
        }

        pub fn contact_point(&self) -> Result<SocketAddr> {
            self.ensure_ready()?;
            Ok(self.addr)
        }

        /// Client settings pointed at this node, starting from `base`.
        pub fn client_config(&self, base: ClientConfig) -> Result<ClientConfig> {
            let addr = self.contact_point()?;
            Ok(ClientConfig {
                contact_points: vec![addr.ip().to_string()],
                port: addr.port(),
                ..base
            })
        }

        pub async fn connect(&self, options: &ConnectOptions) -> Result<Connection> {
            let addr = self.contact_point()?;
            connection::connect(&[addr.ip().to_string()], addr.port(), options).await
        }

        pub fn data_dir(&self) -> Option<&Path> {
            self.data_dir.as_ref().map(|d| d.path())
        }

        /// Best-effort read of the captured stdout log.
        pub fn read_stdout(&self) -> String {
            std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
        }

        /// Best-effort read of the captured stderr log.
        pub fn read_stderr(&self) -> String {
            std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
        }
    }

    impl Drop for EmbeddedNode {
        fn drop(&mut self) {
            if self.child.is_none() {
                return;
            }
            // Never blocks: the stop command is spawned, not waited on.
            // `stop().await` is the path that waits for it.
            if let Some(mut cmd) = self.stop_command() {
                if let Err(err) = cmd.spawn() {
                    warn!(error = %err, "stop command failed");
                }
            }
            if let Some(child) = self.child.as_mut() {
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "failed to kill node process");
                }
            }
        }
    }
}

pub mod domain {
    use scylla_cql::frame::response::result::CqlValue;
    use serde::{Deserialize, Serialize};

    use crate::codec::{Entity, Record};
    use crate::error::{Error, Result};
    use crate::schema::{ColumnDef, ColumnType};

    pub const ORDER_TABLE: &str = "order_data";

    static ORDER_COLUMNS: [ColumnDef; 3] = [
        ColumnDef::partition_key("order_id", ColumnType::Text),
        ColumnDef::regular("amount", ColumnType::Float),
        ColumnDef::regular("discount", ColumnType::Float),
    ];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Order {
        pub order_id: String,
        pub amount: f32,
        pub discount: f32,
    }

    impl Order {
        pub fn new(order_id: impl Into<String>, amount: f32, discount: f32) -> Self {
            Self {
                order_id: order_id.into(),
                amount,
                discount,
            }
        }
    }

    impl Entity for Order {
        type Key = String;

        const TABLE: &'static str = ORDER_TABLE;

        fn columns() -> &'static [ColumnDef] {
            &ORDER_COLUMNS
        }

        fn key(&self) -> String {
            self.order_id.clone()
        }

        fn key_value(key: &String) -> CqlValue {
            CqlValue::Text(key.clone())
        }

        fn encode(&self) -> Result<Record> {
            if self.order_id.is_empty() {
                return Err(Error::Codec {
                    column: "order_id".into(),
                    detail: "key must not be empty".into(),
                });
            }
            Ok(Record::new()
                .with("order_id", CqlValue::Text(self.order_id.clone()))
                .with("amount", CqlValue::Float(self.amount))
                .with("discount", CqlValue::Float(self.discount)))
        }

        fn decode(record: &Record) -> Result<Self> {
            Ok(Self {
                order_id: record.text("order_id")?,
                amount: record.float("amount")?,
                discount: record.float("discount")?,
            })
        }
    }
}

pub mod telemetry {
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    /// Human-friendly logging to stderr; honours `RUST_LOG`. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
            .try_init();
    }

    /// Same as `init_tracing` but routed through the test harness' capture.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(Level::DEBUG.into()))
            .with_test_writer()
            .try_init();
    }
}

pub use codec::{Entity, Record};
pub use config::{ClientConfig, ConnectOptions, SchemaAction};
pub use connection::{connect, connect_with_config, Connection};
pub use domain::Order;
pub use error::{Error, Result};
pub use harness::{EmbeddedNode, NodeConfig, NodeState};
pub use repository::{KeyLookup, Page, Repository};
pub use schema::{KeyspaceSpec, ReplicationSpec, SchemaManager, TableSchema};
