//! Entities and a scripted store shared by the unit tests of this crate.

use crate::registry::SchemaRegistry;
use keel_core::{
    Entity, Error, FieldInfo, LinkTableInfo, QueryError, QueryErrorKind, RelationshipInfo, Result,
    Row, SqlType, Store, Value,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

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
            FieldInfo::new("name", SqlType::VarChar(100)).max_length(100),
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
            FieldInfo::new("make", SqlType::VarChar(100)).max_length(100),
            FieldInfo::new("model", SqlType::VarChar(100)).max_length(100),
            FieldInfo::new("year", SqlType::Integer).range(1900, 2100),
            FieldInfo::new("dealer_id", SqlType::BigInt)
                .nullable(true)
                .foreign_key("dealers.id"),
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
            dealer_id: row.get_named("dealer_id")?,
            is_deleted: row.get_named("is_deleted")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: Option<i64>,
    pub name: String,
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

/// Join entity between cars and customers.
#[derive(Debug, Clone, PartialEq)]
pub struct CarOrder {
    pub car_id: i64,
    pub customer_id: i64,
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
                .foreign_key("customers.id"),
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

/// Half of a required foreign key cycle (`teams.captain_id -> players.id`).
#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: Option<i64>,
    pub captain_id: i64,
}

impl Entity for Team {
    const TABLE_NAME: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::many_to_one("captain", "players", "captain_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("captain_id", SqlType::BigInt).foreign_key("players.id"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("captain_id", self.captain_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            captain_id: row.get_named::<Option<i64>>("captain_id")?.unwrap_or_default(),
        })
    }
}

/// Other half of the cycle (`players.team_id -> teams.id`).
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: Option<i64>,
    pub team_id: i64,
}

impl Entity for Player {
    const TABLE_NAME: &'static str = "players";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::many_to_one("team", "teams", "team_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("team_id", SqlType::BigInt).foreign_key("teams.id"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("team_id", self.team_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            team_id: row.get_named::<Option<i64>>("team_id")?.unwrap_or_default(),
        })
    }
}

pub fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register::<Dealer>().unwrap();
    registry.register::<Car>().unwrap();
    registry.register::<Customer>().unwrap();
    registry.register::<CarOrder>().unwrap();
    registry.register::<Team>().unwrap();
    registry.register::<Player>().unwrap();
    Arc::new(registry)
}

pub fn dealer_row(id: i64, name: &str) -> Row {
    Row::from_pairs(vec![
        ("id", Value::BigInt(id)),
        ("name", name.into()),
        ("city", "New York".into()),
    ])
}

pub fn car_row(id: i64, make: &str, model: &str, dealer_id: Option<i64>) -> Row {
    Row::from_pairs(vec![
        ("id", Value::BigInt(id)),
        ("make", make.into()),
        ("model", model.into()),
        ("year", Value::Int(2020)),
        ("dealer_id", dealer_id.into()),
        ("is_deleted", Value::Int(0)),
    ])
}

/// What the next `query` call answers.
pub enum Response {
    Rows(Vec<Row>),
    /// Never resolves; used to exercise cancellation.
    Stall,
}

#[derive(Default)]
struct Script {
    log: Vec<String>,
    responses: VecDeque<Response>,
    next_key: i64,
    fail_on: Option<(String, QueryErrorKind)>,
    in_transaction: bool,
    /// Parameters bound by each query, in order.
    bound: Vec<usize>,
    max_params: Option<usize>,
}

/// A store that records every statement and answers queries from a script.
#[derive(Default)]
pub struct ScriptedStore {
    script: Mutex<Script>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn respond(&self, response: Response) {
        self.lock().responses.push_back(response);
    }

    /// Fail the first statement containing `needle` with `kind`.
    pub fn fail_on(&self, needle: &str, kind: QueryErrorKind) {
        self.lock().fail_on = Some((needle.to_string(), kind));
    }

    /// Accept at most `n` parameters per statement.
    pub fn limit_params(&self, n: usize) {
        self.lock().max_params = Some(n);
    }

    /// Parameter counts of every query so far.
    pub fn bound(&self) -> Vec<usize> {
        self.lock().bound.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn selects(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|sql| sql.starts_with("SELECT"))
            .count()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut script = self.lock();
        script.log.push(sql.to_string());
        if let Some((needle, kind)) = script.fail_on.clone() {
            if sql.contains(&needle) {
                script.fail_on = None;
                return Err(Error::Query(
                    QueryError::new(kind, format!("scripted failure on {}", needle)).with_sql(sql),
                ));
            }
        }
        Ok(())
    }
}

impl Store for ScriptedStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql)?;
        self.lock().bound.push(params.len());
        let response = self.lock().responses.pop_front();
        match response {
            Some(Response::Rows(rows)) => Ok(rows),
            Some(Response::Stall) => std::future::pending().await,
            None => Ok(Vec::new()),
        }
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.record(sql)?;
        Ok(1)
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.record("BEGIN")?;
        self.lock().in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.record("COMMIT")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("ROLLBACK")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    async fn last_generated_key(&self) -> Result<i64> {
        let mut script = self.lock();
        script.next_key += 1;
        Ok(script.next_key)
    }

    fn max_params(&self) -> usize {
        self.lock().max_params.unwrap_or(usize::MAX)
    }
}
