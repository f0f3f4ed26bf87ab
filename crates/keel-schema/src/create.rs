//! CREATE TABLE statement builder.

use keel_core::{Entity, EntityDescriptor, FieldInfo, quote_ident};

/// Builder for CREATE TABLE statements.
///
/// A single auto-increment integer key is rendered inline as
/// `INTEGER PRIMARY KEY AUTOINCREMENT`, the only form SQLite accepts for
/// rowid aliases. Every other key becomes a `PRIMARY KEY (...)` constraint.
#[derive(Debug, Clone, Copy)]
pub struct CreateTable {
    descriptor: EntityDescriptor,
    if_not_exists: bool,
}

impl CreateTable {
    /// Create a new CREATE TABLE builder for a descriptor.
    pub fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            if_not_exists: false,
        }
    }

    /// Builder for an entity type.
    pub fn of<E: Entity>() -> Self {
        Self::new(E::descriptor())
    }

    /// Add IF NOT EXISTS clause.
    #[must_use]
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Build the CREATE TABLE SQL.
    pub fn build(&self) -> String {
        let d = &self.descriptor;
        let mut sql = String::from("CREATE TABLE ");

        if self.if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }

        sql.push_str(&quote_ident(d.table));
        sql.push_str(" (\n  ");

        let inline_key = d.generated_key().map(|f| f.name);
        let mut column_defs: Vec<String> = d
            .fields
            .iter()
            .map(|f| column_definition(f, inline_key == Some(f.name)))
            .collect();
        let mut constraints = Vec::new();

        if inline_key.is_none() && !d.primary_key.is_empty() {
            constraints.push(format!("PRIMARY KEY ({})", column_list(d.primary_key)));
        }

        for columns in d.unique_sets() {
            constraints.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                quote_ident(&format!("uk_{}_{}", d.table, columns.join("_"))),
                column_list(&columns)
            ));
        }

        for (field, table, column) in d.foreign_keys() {
            let mut fk = format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({})",
                quote_ident(&format!("fk_{}_{}", d.table, field.name)),
                quote_ident(field.name),
                quote_ident(table),
                quote_ident(column)
            );
            if let Some(action) = field.on_delete {
                fk.push_str(" ON DELETE ");
                fk.push_str(action.as_sql());
            }
            constraints.push(fk);
        }

        column_defs.append(&mut constraints);
        sql.push_str(&column_defs.join(",\n  "));
        sql.push_str("\n)");

        sql
    }
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_definition(field: &FieldInfo, inline_key: bool) -> String {
    if inline_key {
        return format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_ident(field.name)
        );
    }

    let mut def = format!("{} {}", quote_ident(field.name), field.sql_type.sql_name());

    if !field.nullable {
        def.push_str(" NOT NULL");
    }

    if let Some(default) = field.default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }

    def
}

/// DROP TABLE statement for a table.
pub fn drop_table_sql(table: &str, if_exists: bool) -> String {
    if if_exists {
        format!("DROP TABLE IF EXISTS {}", quote_ident(table))
    } else {
        format!("DROP TABLE {}", quote_ident(table))
    }
}
