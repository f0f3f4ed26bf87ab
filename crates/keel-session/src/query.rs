//! Typed queries over tracked entities.
//!
//! A [`Query`] selects rows of one entity with equality filters, ordering
//! and a limit, then eagerly loads any number of relationship paths. Each
//! root row and each relationship hop costs exactly one store lookup.
//!
//! ```ignore
//! let cars = uow
//!     .query::<Car>()
//!     .filter_eq("make", "Toyota")
//!     .order_by("year")
//!     .include("dealer")
//!     .all()
//!     .await?;
//! ```

use crate::loader::{LoadContext, StagedLoad, column_list};
use crate::unit_of_work::UnitOfWork;
use crate::EntityRef;
use keel_core::{Entity, Error, QueryErrorKind, Result, Store, Value, quote_ident};
use std::marker::PhantomData;

/// Sort direction of an `ORDER BY` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Asc,
    Desc,
}

/// Builder for a select over `E`, bound to one unit of work.
pub struct Query<'u, S: Store, E: Entity> {
    uow: &'u mut UnitOfWork<S>,
    filters: Vec<(&'static str, Value)>,
    order: Vec<(&'static str, Direction)>,
    limit: Option<usize>,
    includes: Vec<String>,
    error: Option<Error>,
    _entity: PhantomData<fn() -> E>,
}

impl<S: Store, E: Entity> std::fmt::Debug for Query<'_, S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &E::TABLE_NAME)
            .field("filters", &self.filters)
            .field("order", &self.order)
            .field("limit", &self.limit)
            .field("includes", &self.includes)
            .finish_non_exhaustive()
    }
}

impl<'u, S: Store, E: Entity> Query<'u, S, E> {
    pub(crate) fn new(uow: &'u mut UnitOfWork<S>) -> Self {
        Self {
            uow,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            includes: Vec::new(),
            error: None,
            _entity: PhantomData,
        }
    }

    fn column(&mut self, name: &str) -> Option<&'static str> {
        let found = E::fields().iter().find(|f| f.name == name).map(|f| f.name);
        if found.is_none() && self.error.is_none() {
            self.error = Some(Error::query(
                QueryErrorKind::NotFound,
                format!("'{}' has no column '{}'", E::TABLE_NAME, name),
            ));
        }
        found
    }

    /// Keep rows where `column` equals `value`.
    #[must_use]
    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        if let Some(column) = self.column(column) {
            self.filters.push((column, value.into()));
        }
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str) -> Self {
        if let Some(column) = self.column(column) {
            self.order.push((column, Direction::Asc));
        }
        self
    }

    #[must_use]
    pub fn order_by_desc(mut self, column: &str) -> Self {
        if let Some(column) = self.column(column) {
            self.order.push((column, Direction::Desc));
        }
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Eagerly load a relationship path (`"dealer"`, `"dealer.cars"`).
    #[must_use]
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    /// SQL text and parameters of the root select.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let descriptor = E::descriptor();
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list(&descriptor, None),
            quote_ident(E::TABLE_NAME)
        );
        let mut params = Vec::new();
        if !self.filters.is_empty() {
            let clauses = self
                .filters
                .iter()
                .map(|(col, value)| {
                    if value.is_null() {
                        format!("{} IS NULL", quote_ident(col))
                    } else {
                        params.push(value.clone());
                        format!("{} = ${}", quote_ident(col), params.len())
                    }
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&clauses);
        }
        if !self.order.is_empty() {
            let terms = self
                .order
                .iter()
                .map(|(col, dir)| match dir {
                    Direction::Asc => quote_ident(col),
                    Direction::Desc => format!("{} DESC", quote_ident(col)),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms);
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        (sql, params)
    }

    /// Run the query and every include, then register the results.
    ///
    /// Rows already tracked resolve to the tracked instance, whose in-memory
    /// values win over the stored row. Entities marked for deletion are left
    /// out.
    #[tracing::instrument(level = "debug", skip(self), fields(table = E::TABLE_NAME))]
    pub async fn all(self) -> Result<Vec<EntityRef<E>>> {
        let (sql, params) = self.to_sql();
        let Query {
            uow,
            includes,
            error,
            ..
        } = self;
        if let Some(e) = error {
            return Err(e);
        }
        uow.ensure_open()?;
        uow.registry.descriptor::<E>()?;

        let staged = {
            let ctx = LoadContext::new(&uow.registry, &uow.map);
            for path in &includes {
                ctx.resolve_path(E::TABLE_NAME, path)?;
            }
            let rows = uow.store.query(&sql, &params).await?;
            let mut staged = StagedLoad::default();
            LoadContext::count_query(&mut staged);
            let roots = ctx.stage_rows(E::TABLE_NAME, &rows, &mut staged)?;
            LoadContext::set_roots(&mut staged, &roots);
            for path in &includes {
                ctx.fetch(&uow.store, E::TABLE_NAME, roots.clone(), path, &mut staged)
                    .await?;
            }
            staged
        };
        tracing::debug!(queries = staged.queries(), "Query fetched");

        let roots = staged.apply(&mut uow.map, &mut uow.tracker, &mut uow.navigations);
        Ok(roots
            .iter()
            .filter_map(|key| uow.map.get::<E>(key))
            .collect())
    }

    /// Run the query with `LIMIT 1`.
    pub async fn first(self) -> Result<Option<EntityRef<E>>> {
        Ok(self.limit(1).all().await?.into_iter().next())
    }
}
