//! Column definitions and table-level storage attributes

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Date,
    DateTime,
    Decimal,
    Char,
    Varchar,
}

impl ColumnType {
    pub fn tag(self) -> u8 {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::TinyInt => 2,
            ColumnType::SmallInt => 3,
            ColumnType::Int => 4,
            ColumnType::BigInt => 5,
            ColumnType::Float => 6,
            ColumnType::Double => 7,
            ColumnType::Date => 8,
            ColumnType::DateTime => 9,
            ColumnType::Decimal => 10,
            ColumnType::Char => 11,
            ColumnType::Varchar => 12,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let ty = match tag {
            1 => ColumnType::Boolean,
            2 => ColumnType::TinyInt,
            3 => ColumnType::SmallInt,
            4 => ColumnType::Int,
            5 => ColumnType::BigInt,
            6 => ColumnType::Float,
            7 => ColumnType::Double,
            8 => ColumnType::Date,
            9 => ColumnType::DateTime,
            10 => ColumnType::Decimal,
            11 => ColumnType::Char,
            12 => ColumnType::Varchar,
            _ => return None,
        };
        Some(ty)
    }
}

/// Aggregation applied to a value column of an aggregate-keys table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    Sum,
    Min,
    Max,
    Replace,
}

impl AggregateType {
    pub fn tag(self) -> u8 {
        match self {
            AggregateType::Sum => 1,
            AggregateType::Min => 2,
            AggregateType::Max => 3,
            AggregateType::Replace => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(AggregateType::Sum),
            2 => Some(AggregateType::Min),
            3 => Some(AggregateType::Max),
            4 => Some(AggregateType::Replace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Declared length for char/varchar, 0 otherwise
    pub length: u32,
    pub is_key: bool,
    pub aggregation: Option<AggregateType>,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub comment: String,
}

impl Column {
    pub fn key(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            length: 0,
            is_key: true,
            aggregation: None,
            nullable: false,
            default_value: None,
            comment: String::new(),
        }
    }

    pub fn value(name: &str, column_type: ColumnType) -> Self {
        Self {
            is_key: false,
            nullable: true,
            ..Self::key(name, column_type)
        }
    }

    pub fn with_aggregation(mut self, aggregation: AggregateType) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn with_default(mut self, default_value: &str) -> Self {
        self.default_value = Some(default_value.to_string());
        self
    }
}

/// Key semantics of a table, forwarded to backends with every migration task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeysType {
    DupKeys,
    UniqueKeys,
    AggKeys,
}

/// On-disk layout of an index's segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEncoding {
    Row,
    Column,
}

/// Bloom filter settings of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilterInfo {
    pub columns: std::collections::BTreeSet<String>,
    pub false_positive_probability: f64,
}
