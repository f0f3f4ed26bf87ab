//! Dealership entities used by this crate's unit tests.

use keel_core::{
    Entity, FieldInfo, LinkTableInfo, ReferentialAction, RelationshipInfo, Result, Row, SqlType,
    Value,
};
use keel_session::SchemaRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct Dealer {
    pub id: Option<i64>,
    pub name: String,
}

impl Dealer {
    pub fn with_id(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
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

#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub id: Option<i64>,
    pub make: String,
    pub model: String,
    pub dealer_id: Option<i64>,
    pub is_deleted: bool,
}

impl Car {
    pub fn new(make: &str, model: &str, dealer_id: Option<i64>) -> Self {
        Self {
            id: None,
            make: make.to_string(),
            model: model.to_string(),
            dealer_id,
            is_deleted: false,
        }
    }
}

impl Entity for Car {
    const TABLE_NAME: &'static str = "cars";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const UNIQUE: &'static [&'static [&'static str]] = &[&["make", "model"]];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::many_to_one("dealer", "dealers", "dealer_id")];
    const SOFT_DELETE: Option<&'static str> = Some("is_deleted");

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("make", SqlType::VarChar(100)),
            FieldInfo::new("model", SqlType::VarChar(100)),
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
            ("dealer_id", self.dealer_id.into()),
            ("is_deleted", self.is_deleted.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            make: row.get_named("make")?,
            model: row.get_named("model")?,
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

/// Registry with the join entity registered first, so creation order has
/// to move it behind the tables it references.
pub fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register::<CarOrder>().unwrap();
    registry.register::<Car>().unwrap();
    registry.register::<Customer>().unwrap();
    registry.register::<Dealer>().unwrap();
    registry
}
