//! Parameterized SQL statements that can be re-bound for every retry attempt.

use sqlx::{sqlite::SqliteArguments, Arguments};
use uuid::Uuid;

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Uuid(Uuid),
    Text(String),
    Int(i64),
    Null,
}

impl From<Uuid> for Param {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Int(value.into())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// SQL text plus its positional (`?`) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Appends a SQL fragment, separated from the existing text by a space.
    pub fn push(mut self, fragment: &str) -> Self {
        if !self.sql.is_empty() && !self.sql.ends_with(char::is_whitespace) {
            self.sql.push(' ');
        }
        self.sql.push_str(fragment);
        self
    }

    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Appends `IN (?, ?, ...)` with one placeholder per value.
    pub fn push_in<T, I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Param>,
    {
        let start = self.params.len();
        self.params.extend(values.into_iter().map(Into::into));

        let placeholders = vec!["?"; self.params.len() - start].join(", ");
        self.push(&format!("IN ({placeholders})"))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Builds a fresh argument buffer borrowing from this statement.
    pub fn arguments(&self) -> Result<SqliteArguments<'_>, sqlx::Error> {
        let mut args = SqliteArguments::default();

        for param in &self.params {
            match param {
                Param::Uuid(v) => args.add(*v),
                Param::Text(v) => args.add(v.as_str()),
                Param::Int(v) => args.add(*v),
                Param::Null => args.add(Option::<i64>::None),
            }
            .map_err(sqlx::Error::Encode)?;
        }

        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_in() {
        let stmt = Statement::new("SELECT COUNT(id) FROM t WHERE a = ?")
            .bind(1i64)
            .push("AND b")
            .push_in([2i64, 3i64]);

        assert_eq!(stmt.sql(), "SELECT COUNT(id) FROM t WHERE a = ? AND b IN (?, ?)");
        assert_eq!(
            stmt.params(),
            &[Param::Int(1), Param::Int(2), Param::Int(3)]
        );
    }

    #[test]
    fn test_optional_params() {
        let stmt = Statement::new("?, ?")
            .bind(Option::<Uuid>::None)
            .bind(Some("x"));

        assert_eq!(stmt.params(), &[Param::Null, Param::Text("x".to_owned())]);
    }

    #[test]
    fn test_arguments_bind_every_param() {
        let stmt = Statement::new("?, ?, ?, ?")
            .bind(Uuid::nil())
            .bind("a")
            .bind(true)
            .bind(Option::<i64>::None);

        assert!(stmt.arguments().is_ok());
    }
}
