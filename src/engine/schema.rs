//! Table schema definitions for the row engine.

/// A single column definition.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Part of the table's primary key
    pub is_primary_key: bool,
}

impl Column {
    /// Create a new column.
    pub fn new(name: &str, is_primary_key: bool) -> Self {
        Self {
            name: name.to_string(),
            is_primary_key,
        }
    }
}

/// A declared single-column foreign key reference.
///
/// The referencing column points at the (single-column) primary key of the
/// parent table.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// Ordinal of the referencing column
    pub column: usize,
    /// Name of the parent table
    pub parent_table: String,
}

/// Schema of one tracked table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub columns: Vec<Column>,
    /// Declared foreign keys
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Create an empty schema for `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Append a column. Builder-style for table setup.
    pub fn column(mut self, name: &str, is_primary_key: bool) -> Self {
        self.columns.push(Column::new(name, is_primary_key));
        self
    }

    /// Append a foreign key from `column` to `parent_table`'s primary key.
    pub fn foreign_key(mut self, column: usize, parent_table: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column,
            parent_table: parent_table.to_string(),
        });
        self
    }

    /// Number of columns.
    pub fn n_col(&self) -> usize {
        self.columns.len()
    }

    /// One flag per column, true iff that ordinal is part of the primary key.
    pub fn pk_flags(&self) -> Vec<bool> {
        self.columns.iter().map(|c| c.is_primary_key).collect()
    }

    /// Whether any column is part of the primary key.
    pub fn has_pk(&self) -> bool {
        self.columns.iter().any(|c| c.is_primary_key)
    }

    /// Ordinals of the primary-key columns, in declaration order.
    pub fn pk_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether two tables agree on name, column set, and primary key
    /// definition. This is the precondition for loading a table diff.
    pub fn compatible_with(&self, other: &TableSchema) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| {
                    a.name.eq_ignore_ascii_case(&b.name)
                        && a.is_primary_key == b.is_primary_key
                })
    }
}
