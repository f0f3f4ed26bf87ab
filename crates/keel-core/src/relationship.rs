//! Relationship descriptors.
//!
//! Entities never embed their related entities. A relationship names the key
//! columns that connect two tables and the loader resolves the link through
//! the identity map.

/// Kind of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// Many `Car`s belong to one `Dealer` (FK lives on this entity).
    ManyToOne,
    /// One `Dealer` has many `Car`s (FK lives on the related entity).
    OneToMany,
    /// `Car`s have many `Customer`s through a join entity.
    ManyToMany,
}

/// The join entity realizing a many-to-many relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// Join entity table (e.g., `"car_orders"`).
    pub table_name: &'static str,
    /// Column pointing at the owning side (e.g., `"car_id"`).
    pub local_column: &'static str,
    /// Column pointing at the related side (e.g., `"customer_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }
}

/// A navigable relationship declared on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Navigation name (e.g., `"dealer"`).
    pub name: &'static str,
    /// Table of the related entity.
    pub related_table: &'static str,
    pub kind: RelationshipKind,
    /// FK column on this entity (many-to-one).
    pub local_key: Option<&'static str>,
    /// FK column on the related entity (one-to-many).
    pub remote_key: Option<&'static str>,
    /// Join entity (many-to-many).
    pub link_table: Option<LinkTableInfo>,
}

impl RelationshipInfo {
    pub const fn many_to_one(
        name: &'static str,
        related_table: &'static str,
        local_key: &'static str,
    ) -> Self {
        Self {
            name,
            related_table,
            kind: RelationshipKind::ManyToOne,
            local_key: Some(local_key),
            remote_key: None,
            link_table: None,
        }
    }

    pub const fn one_to_many(
        name: &'static str,
        related_table: &'static str,
        remote_key: &'static str,
    ) -> Self {
        Self {
            name,
            related_table,
            kind: RelationshipKind::OneToMany,
            local_key: None,
            remote_key: Some(remote_key),
            link_table: None,
        }
    }

    pub const fn many_to_many(
        name: &'static str,
        related_table: &'static str,
        link: LinkTableInfo,
    ) -> Self {
        Self {
            name,
            related_table,
            kind: RelationshipKind::ManyToMany,
            local_key: None,
            remote_key: None,
            link_table: Some(link),
        }
    }

    /// Does this relationship yield at most one related entity?
    pub const fn is_single(&self) -> bool {
        matches!(self.kind, RelationshipKind::ManyToOne)
    }
}

/// Find a relationship by name.
pub fn find_relationship<'a>(
    relationships: &'a [RelationshipInfo],
    name: &str,
) -> Option<&'a RelationshipInfo> {
    relationships.iter().find(|r| r.name == name)
}
