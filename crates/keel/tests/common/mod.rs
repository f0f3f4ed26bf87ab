//! Dealership model shared by the integration tests.

#![allow(dead_code)]

use keel::prelude::*;
use keel::{Row, SqliteStore, Store};
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

static TRACING: Once = Once::new();

/// Install a fmt subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dealer {
    pub id: Option<i64>,
    pub name: String,
    pub city: String,
}

impl Dealer {
    pub fn new(name: &str, city: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            city: city.to_string(),
        }
    }
}

impl Entity for Dealer {
    const TABLE_NAME: &'static str = "dealers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::one_to_many("cars", "cars", "dealer_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", SqlType::VarChar(100))
                .unique(true)
                .max_length(100),
            FieldInfo::new("city", SqlType::VarChar(100)),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("city", self.city.clone().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            city: row.get_named("city")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub id: Option<i64>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub dealer_id: Option<i64>,
    pub is_deleted: bool,
}

impl Car {
    pub fn new(make: &str, model: &str, year: i32) -> Self {
        Self {
            id: None,
            make: make.to_string(),
            model: model.to_string(),
            year,
            price: 20_000.0,
            dealer_id: None,
            is_deleted: false,
        }
    }
}

impl Entity for Car {
    const TABLE_NAME: &'static str = "cars";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const UNIQUE: &'static [&'static [&'static str]] = &[&["make", "model"]];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::many_to_one("dealer", "dealers", "dealer_id"),
        RelationshipInfo::many_to_many(
            "customers",
            "customers",
            LinkTableInfo::new("car_orders", "car_id", "customer_id"),
        ),
    ];
    const SOFT_DELETE: Option<&'static str> = Some("is_deleted");

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("make", SqlType::VarChar(50)).max_length(50),
            FieldInfo::new("model", SqlType::VarChar(50)).max_length(50),
            FieldInfo::new("year", SqlType::Integer).range(1900, 2100),
            FieldInfo::new("price", SqlType::Real),
            FieldInfo::new("dealer_id", SqlType::BigInt)
                .nullable(true)
                .foreign_key("dealers.id")
                .on_delete(ReferentialAction::SetNull),
            FieldInfo::new("is_deleted", SqlType::Boolean).default("0"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("make", self.make.clone().into()),
            ("model", self.model.clone().into()),
            ("year", self.year.into()),
            ("price", self.price.into()),
            ("dealer_id", self.dealer_id.into()),
            ("is_deleted", self.is_deleted.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            make: row.get_named("make")?,
            model: row.get_named("model")?,
            year: row.get_named("year")?,
            price: row.get_named("price")?,
            dealer_id: row.get_named("dealer_id")?,
            is_deleted: row.get_named("is_deleted")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: Option<i64>,
    pub name: String,
    pub phone: Option<String>,
}

impl Customer {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            phone: None,
        }
    }
}

impl Entity for Customer {
    const TABLE_NAME: &'static str = "customers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[RelationshipInfo::many_to_many(
        "cars",
        "cars",
        LinkTableInfo::new("car_orders", "customer_id", "car_id"),
    )];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", SqlType::VarChar(100)),
            FieldInfo::new("phone", SqlType::VarChar(20)).nullable(true),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("phone", self.phone.clone().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            phone: row.get_named("phone")?,
        })
    }
}

/// Join entity: one row per (car, customer) order.
#[derive(Debug, Clone, PartialEq)]
pub struct CarOrder {
    pub car_id: i64,
    pub customer_id: i64,
}

impl CarOrder {
    /// Order whose keys are filled in through `UnitOfWork::relate`.
    pub fn unlinked() -> Self {
        Self {
            car_id: 0,
            customer_id: 0,
        }
    }
}

impl Entity for CarOrder {
    const TABLE_NAME: &'static str = "car_orders";
    const PRIMARY_KEY: &'static [&'static str] = &["car_id", "customer_id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::many_to_one("car", "cars", "car_id"),
        RelationshipInfo::many_to_one("customer", "customers", "customer_id"),
    ];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("car_id", SqlType::BigInt)
                .primary_key(true)
                .foreign_key("cars.id"),
            FieldInfo::new("customer_id", SqlType::BigInt)
                .primary_key(true)
                .foreign_key("customers.id")
                .on_delete(ReferentialAction::Cascade),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("car_id", self.car_id.into()),
            ("customer_id", self.customer_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            car_id: row.get_named("car_id")?,
            customer_id: row.get_named("customer_id")?,
        })
    }
}

/// Branch office; salespeople reference it without an ON DELETE action.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: Option<i64>,
    pub name: String,
}

impl Branch {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl Entity for Branch {
    const TABLE_NAME: &'static str = "branches";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", SqlType::VarChar(100)).unique(true),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Salesperson {
    pub id: Option<i64>,
    pub name: String,
    pub branch_id: i64,
}

impl Salesperson {
    pub fn new(name: &str, branch_id: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            branch_id,
        }
    }
}

impl Entity for Salesperson {
    const TABLE_NAME: &'static str = "salespeople";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::many_to_one("branch", "branches", "branch_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", SqlType::VarChar(100)),
            FieldInfo::new("branch_id", SqlType::BigInt).foreign_key("branches.id"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("branch_id", self.branch_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            branch_id: row.get_named("branch_id")?,
        })
    }
}

/// Branches and salespeople only.
pub fn staff_registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register::<Branch>().unwrap();
    registry.register::<Salesperson>().unwrap();
    Arc::new(registry)
}

pub fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register::<Dealer>().unwrap();
    registry.register::<Car>().unwrap();
    registry.register::<Customer>().unwrap();
    registry.register::<CarOrder>().unwrap();
    Arc::new(registry)
}

/// In-memory store with the dealership schema and no rows.
pub async fn empty_store(registry: &SchemaRegistry) -> SqliteStore {
    init_tracing();
    let store = SqliteStore::open_memory().unwrap();
    MigrationRunner::default()
        .ensure_schema(&store, registry)
        .await
        .unwrap();
    store
}

/// Every row of `table` ordered by its first column.
pub async fn rows<S: Store>(store: &S, table: &str) -> Vec<Row> {
    store
        .query(
            &format!("SELECT * FROM {} ORDER BY 1", keel::quote_ident(table)),
            &[],
        )
        .await
        .unwrap()
}

/// Store wrapper counting the lookups issued through it.
#[derive(Debug)]
pub struct CountingStore<S> {
    pub inner: S,
    queries: AtomicUsize,
    yielding: bool,
}

impl<S: Store> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
            yielding: false,
        }
    }

    /// Yield to the runtime once before every lookup, like a networked store.
    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }
}

impl<S: Store> Store for CountingStore<S> {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.yielding {
            tokio::task::yield_now().await;
        }
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute(sql, params).await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.inner.begin_transaction().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn last_generated_key(&self) -> Result<i64> {
        self.inner.last_generated_key().await
    }

    async fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.inner.insert(sql, params).await
    }
}
