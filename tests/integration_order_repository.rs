use scylla_cql::frame::response::result::CqlValue;
use scylla_rust_repo::codec::{Entity, Record};
use scylla_rust_repo::schema::{ColumnDef, ColumnType, IndexDef};
use scylla_rust_repo::telemetry::init_test_tracing;
use scylla_rust_repo::{
    connect_with_config, ClientConfig, Connection, Error, KeyspaceSpec, Order, ReplicationSpec,
    Repository, SchemaAction, SchemaManager, TableSchema,
};

const KEYSPACE: &str = "scylla_rust_repo_it";

async fn live_connection() -> Option<(Connection, ClientConfig)> {
    if std::env::var("SCYLLA_URI").is_err() {
        eprintln!("SCYLLA_URI not set; skipping");
        return None;
    }
    init_test_tracing();
    let mut cfg = ClientConfig::from_env().expect("config");
    cfg.keyspace = KeyspaceSpec::new(KEYSPACE, ReplicationSpec::simple(1));
    let conn = connect_with_config(&cfg).await.expect("connect");
    Some((conn, cfg))
}

async fn order_repository() -> Option<Repository<Order>> {
    let (conn, cfg) = live_connection().await?;
    Some(
        Repository::<Order>::open_with_config(conn, &cfg)
            .await
            .expect("open repository"),
    )
}

#[tokio::test]
#[ignore]
async fn saved_order_is_found_by_key() -> anyhow::Result<()> {
    let Some(repo) = order_repository().await else {
        return Ok(());
    };
    let order = Order::new("1212", 1212.12, 12.12);
    repo.save(&order).await?;
    let found = repo.find_by_key("1212").collect().await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].order_id, "1212");
    assert_eq!(found[0], order);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn second_save_overwrites_first() -> anyhow::Result<()> {
    let Some(repo) = order_repository().await else {
        return Ok(());
    };
    repo.save(&Order::new("upsert-1", 10.0, 1.0)).await?;
    repo.save(&Order::new("upsert-1", 20.5, 1.0)).await?;
    let found = repo.find_by_key("upsert-1").collect().await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].amount, 20.5);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn missing_key_yields_empty_sequence() {
    let Some(repo) = order_repository().await else {
        return;
    };
    let lookup = repo.find_by_key("no-such-order");
    assert!(lookup.collect().await.unwrap().is_empty());
    // restartable: running it again gives the same answer
    assert!(lookup.first().await.unwrap().is_none());
    assert!(!repo.exists("no-such-order").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn delete_removes_row() {
    let Some(repo) = order_repository().await else {
        return;
    };
    repo.save(&Order::new("to-delete", 1.0, 0.0)).await.unwrap();
    assert!(repo.exists("to-delete").await.unwrap());
    repo.delete("to-delete").await.unwrap();
    assert!(!repo.exists("to-delete").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn paged_scan_visits_every_row() {
    let Some(repo) = order_repository().await else {
        return;
    };
    for i in 0..7 {
        repo.save(&Order::new(format!("page-{i}"), i as f32, 0.0))
            .await
            .unwrap();
    }
    let total = repo.count().await.unwrap();
    let mut seen = 0i64;
    let mut cursor: Option<String> = None;
    loop {
        let page = repo.find_all_paged(3, cursor.as_deref()).await.unwrap();
        assert!(page.items.len() <= 3);
        seen += page.items.len() as i64;
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, total);
    assert!(matches!(
        repo.find_all_paged(3, Some("%%%")).await,
        Err(Error::InvalidCursor(_))
    ));
}

#[tokio::test]
#[ignore]
async fn concurrent_saves_share_one_connection() {
    let Some(repo) = order_repository().await else {
        return;
    };
    let mut handles = Vec::new();
    for i in 0..16 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let order = Order::new(format!("conc-{i}"), i as f32, 0.5);
            repo.save(&order).await?;
            repo.find_by_key(order.order_id.clone()).collect().await
        }));
    }
    for handle in handles {
        let found = handle.await.unwrap().unwrap();
        assert_eq!(found.len(), 1);
    }
}

#[tokio::test]
#[ignore]
async fn ensure_keyspace_is_idempotent_and_detects_conflicts() {
    let Some((conn, _)) = live_connection().await else {
        return;
    };
    let manager = SchemaManager::new(conn.clone());
    let spec = KeyspaceSpec::new(KEYSPACE, ReplicationSpec::simple(1));
    manager.ensure_keyspace(&spec).await.unwrap();
    manager.ensure_keyspace(&spec).await.unwrap();
    assert!(manager.keyspace_exists(KEYSPACE).await.unwrap());

    let conflicting = KeyspaceSpec::new(KEYSPACE, ReplicationSpec::simple(2));
    assert!(matches!(
        manager.ensure_keyspace(&conflicting).await,
        Err(Error::SchemaConflict { .. })
    ));
    conn.use_keyspace(KEYSPACE).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn schema_action_none_requires_existing_table() {
    let Some((conn, _)) = live_connection().await else {
        return;
    };
    let spec = KeyspaceSpec::new("scylla_rust_repo_absent", ReplicationSpec::simple(1));
    let err = Repository::<Order>::open(conn, &spec, SchemaAction::None)
        .await
        .err()
        .expect("should not open");
    assert!(matches!(err, Error::NotReady(_)));
}

#[tokio::test]
#[ignore]
async fn recreate_starts_from_an_empty_table() {
    let Some((conn, cfg)) = live_connection().await else {
        return;
    };
    let repo = Repository::<Order>::open(conn.clone(), &cfg.keyspace, SchemaAction::CreateIfNotExists)
        .await
        .unwrap();
    repo.save(&Order::new("before-recreate", 1.0, 0.0)).await.unwrap();
    let fresh = Repository::<Order>::open(conn, &cfg.keyspace, SchemaAction::Recreate)
        .await
        .unwrap();
    assert_eq!(fresh.count().await.unwrap(), 0);
}

// Same shape as Order but keyed lookups on `customer` go through a declared index.
#[derive(Debug, Clone, PartialEq)]
struct Invoice {
    invoice_id: String,
    customer: String,
    total: f64,
}

static INVOICE_COLUMNS: [ColumnDef; 3] = [
    ColumnDef::partition_key("invoice_id", ColumnType::Text),
    ColumnDef::regular("customer", ColumnType::Text),
    ColumnDef::regular("total", ColumnType::Double),
];

static INVOICE_INDEXES: [IndexDef; 1] = [IndexDef {
    name: "invoice_by_customer",
    column: "customer",
}];

impl Entity for Invoice {
    type Key = String;

    const TABLE: &'static str = "invoice_data";

    fn columns() -> &'static [ColumnDef] {
        &INVOICE_COLUMNS
    }

    fn indexes() -> &'static [IndexDef] {
        &INVOICE_INDEXES
    }

    fn key(&self) -> String {
        self.invoice_id.clone()
    }

    fn key_value(key: &String) -> CqlValue {
        CqlValue::Text(key.clone())
    }

    fn encode(&self) -> scylla_rust_repo::Result<Record> {
        Ok(Record::new()
            .with("invoice_id", CqlValue::Text(self.invoice_id.clone()))
            .with("customer", CqlValue::Text(self.customer.clone()))
            .with("total", CqlValue::Double(self.total)))
    }

    fn decode(record: &Record) -> scylla_rust_repo::Result<Self> {
        Ok(Self {
            invoice_id: record.text("invoice_id")?,
            customer: record.text("customer")?,
            total: record.double("total")?,
        })
    }
}

#[tokio::test]
#[ignore]
async fn secondary_lookup_uses_declared_index() {
    let Some((conn, cfg)) = live_connection().await else {
        return;
    };
    let repo = Repository::<Invoice>::open_with_config(conn, &cfg).await.unwrap();
    let invoice = Invoice {
        invoice_id: "inv-1".into(),
        customer: "acme".into(),
        total: 99.5,
    };
    repo.save(&invoice).await.unwrap();
    let found = repo
        .find_by("customer", CqlValue::Text("acme".into()))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(found.contains(&invoice));

    assert!(matches!(
        repo.find_by("total", CqlValue::Double(99.5)).await,
        Err(Error::QueryNotSupported { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn unindexed_order_column_is_not_queryable() {
    let Some(repo) = order_repository().await else {
        return;
    };
    assert!(matches!(
        repo.find_by("amount", CqlValue::Float(1.0)).await,
        Err(Error::QueryNotSupported { .. })
    ));
    let schema = TableSchema::for_entity::<Order>(KEYSPACE);
    assert_eq!(repo.schema(), &schema);
}

#[tokio::test]
#[ignore]
async fn index_name_taken_by_another_table_is_a_conflict() -> anyhow::Result<()> {
    let Some((conn, cfg)) = live_connection().await else {
        return Ok(());
    };
    let manager = SchemaManager::new(conn.clone());
    manager.ensure_keyspace(&cfg.keyspace).await?;
    let session = conn.session();
    session
        .query_unpaged(
            format!("CREATE TABLE IF NOT EXISTS {KEYSPACE}.index_holder (id text PRIMARY KEY, customer text)"),
            &[],
        )
        .await?;
    session
        .query_unpaged(
            format!("CREATE INDEX IF NOT EXISTS shared_customer_idx ON {KEYSPACE}.index_holder (customer)"),
            &[],
        )
        .await?;
    conn.await_schema_agreement().await?;

    let invoices = TableSchema::for_entity::<Invoice>(KEYSPACE);
    manager.ensure_table(&invoices).await?;
    let taken = IndexDef {
        name: "shared_customer_idx",
        column: "customer",
    };
    assert!(matches!(
        manager.ensure_index(&invoices, &taken).await,
        Err(Error::SchemaConflict { .. })
    ));
    Ok(())
}
