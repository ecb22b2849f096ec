use crate::StorageError;
use async_trait::async_trait;

/// One end of a score window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    pub(crate) fn to_arg(self) -> String {
        match self {
            ScoreBound::NegInf => "-inf".to_string(),
            ScoreBound::PosInf => "+inf".to_string(),
            ScoreBound::Inclusive(value) => value.to_string(),
            ScoreBound::Exclusive(value) => format!("({}", value),
        }
    }

    pub(crate) fn admits_above(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(bound) => score >= bound,
            ScoreBound::Exclusive(bound) => score > bound,
        }
    }

    pub(crate) fn admits_below(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(bound) => score <= bound,
            ScoreBound::Exclusive(bound) => score < bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOrder {
    Ascending,
    Descending,
}

/// Score-window query over an ordered set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeQuery {
    pub min: ScoreBound,
    pub max: ScoreBound,
    pub order: RangeOrder,
    pub limit: Option<usize>,
}

impl RangeQuery {
    pub fn all() -> Self {
        Self {
            min: ScoreBound::NegInf,
            max: ScoreBound::PosInf,
            order: RangeOrder::Ascending,
            limit: None,
        }
    }

    /// Most recent first.
    pub fn latest(limit: usize) -> Self {
        Self {
            min: ScoreBound::NegInf,
            max: ScoreBound::PosInf,
            order: RangeOrder::Descending,
            limit: Some(limit),
        }
    }

    /// Page of entries strictly older than `cursor`, most recent first.
    pub fn before(cursor: f64, limit: usize) -> Self {
        Self {
            min: ScoreBound::NegInf,
            max: ScoreBound::Exclusive(cursor),
            order: RangeOrder::Descending,
            limit: Some(limit),
        }
    }
}

/// Denormalized read model.
///
/// Every mutating call is an overwrite, union or removal, so replaying it
/// with identical arguments leaves the same state behind.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_fields(&self, key: &str, fields: &[(String, String)])
    -> Result<(), StorageError>;

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    async fn get_all_fields(&self, key: &str) -> Result<Vec<(String, String)>, StorageError>;

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError>;

    /// Returns how many members were not present before the call.
    async fn ordered_add(&self, key: &str, members: &[(String, f64)])
    -> Result<usize, StorageError>;

    /// Like [`CacheStore::ordered_add`], but an existing member's score only ever moves up.
    async fn ordered_raise(
        &self,
        key: &str,
        members: &[(String, f64)],
    ) -> Result<usize, StorageError>;

    async fn ordered_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError>;

    async fn ordered_range(
        &self,
        key: &str,
        query: &RangeQuery,
    ) -> Result<Vec<(String, f64)>, StorageError>;

    async fn ordered_cardinality(&self, key: &str) -> Result<usize, StorageError>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StorageError>;

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    async fn set_cardinality(&self, key: &str) -> Result<usize, StorageError>;
}
