//! Data partitioning for worker pools.
//!
//! A [`DataBundle`] is split once, at pool build time, into one [`Shard`]
//! per worker. Every value kind has its own splitting rule and a matching
//! merge rule, and `merge(split(bundle, n)) == bundle` holds for all of them:
//!
//! | Kind         | Split                                   | Merge        |
//! |--------------|-----------------------------------------|--------------|
//! | `Numeric`    | contiguous chunks, first `L % n` larger | concatenate  |
//! | `Records`    | round-robin, element `i` to `i % n`     | interleave   |
//! | `Collection` | the collection's own `split`            | its `join`   |

pub mod particles;

use crate::error::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::ops::Range;

pub use particles::{Particle, ParticlePool};

/// A domain collection that knows how to split itself along its event axis.
///
/// Implement this for concrete types; the engine stores them type-erased
/// through [`Partitionable`].
pub trait Collection: fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    /// Number of elements along the split axis.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into exactly `n` parts whose `join` reproduces `self`.
    fn split(&self, n: usize) -> Result<Vec<Self>>;

    /// Reassemble parts produced by `split`, in order.
    fn join(parts: Vec<Self>) -> Result<Self>;
}

/// Object-safe view of a [`Collection`].
pub trait Partitionable: fmt::Debug + Send + Sync {
    fn len(&self) -> usize;
    fn split_boxed(&self, n: usize) -> Result<Vec<Box<dyn Partitionable>>>;
    fn join_boxed(&self, rest: &[&dyn Partitionable]) -> Result<Box<dyn Partitionable>>;
    fn clone_boxed(&self) -> Box<dyn Partitionable>;
    fn eq_boxed(&self, other: &dyn Partitionable) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<C: Collection> Partitionable for C {
    fn len(&self) -> usize {
        Collection::len(self)
    }

    fn split_boxed(&self, n: usize) -> Result<Vec<Box<dyn Partitionable>>> {
        Ok(self
            .split(n)?
            .into_iter()
            .map(|part| Box::new(part) as Box<dyn Partitionable>)
            .collect())
    }

    fn join_boxed(&self, rest: &[&dyn Partitionable]) -> Result<Box<dyn Partitionable>> {
        let mut parts = Vec::with_capacity(rest.len() + 1);
        parts.push(self.clone());
        for part in rest {
            let part = part.as_any().downcast_ref::<C>().ok_or_else(|| {
                ForemanError::Partition(format!(
                    "cannot join {} with a different collection type",
                    std::any::type_name::<C>()
                ))
            })?;
            parts.push(part.clone());
        }
        Ok(Box::new(C::join(parts)?))
    }

    fn clone_boxed(&self) -> Box<dyn Partitionable> {
        Box::new(self.clone())
    }

    fn eq_boxed(&self, other: &dyn Partitionable) -> bool {
        other
            .as_any()
            .downcast_ref::<C>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One shardable value in a bundle.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum ShardValue {
    /// Ordered numeric sequence, split contiguously.
    Numeric(Vec<f64>),
    /// Ordered opaque records, split round-robin.
    Records(Vec<serde_json::Value>),
    /// Domain collection, split by its own rule. Never sent over the wire.
    #[serde(skip)]
    Collection(Box<dyn Partitionable>),
}

impl ShardValue {
    pub fn collection<C: Collection>(collection: C) -> Self {
        Self::Collection(Box::new(collection))
    }

    /// Build a `Records` value from anything serializable.
    pub fn records<T: Serialize>(items: impl IntoIterator<Item = T>) -> Result<Self> {
        let records = items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::Records(records))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Records(records) => records.len(),
            Self::Collection(collection) => collection.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Records(_) => "records",
            Self::Collection(_) => "collection",
        }
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Self::Numeric(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_records(&self) -> Option<&[serde_json::Value]> {
        match self {
            Self::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn as_collection<C: Collection>(&self) -> Option<&C> {
        match self {
            Self::Collection(collection) => collection.as_any().downcast_ref::<C>(),
            _ => None,
        }
    }
}

impl Clone for ShardValue {
    fn clone(&self) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(values.clone()),
            Self::Records(records) => Self::Records(records.clone()),
            Self::Collection(collection) => Self::Collection(collection.clone_boxed()),
        }
    }
}

impl PartialEq for ShardValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a == b,
            (Self::Records(a), Self::Records(b)) => a == b,
            (Self::Collection(a), Self::Collection(b)) => a.eq_boxed(b.as_ref()),
            _ => false,
        }
    }
}

impl From<Vec<f64>> for ShardValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Numeric(values)
    }
}

impl From<Vec<serde_json::Value>> for ShardValue {
    fn from(records: Vec<serde_json::Value>) -> Self {
        Self::Records(records)
    }
}

impl From<ParticlePool> for ShardValue {
    fn from(pool: ParticlePool) -> Self {
        Self::collection(pool)
    }
}

/// Ordered mapping of name to shardable value.
///
/// Keys keep insertion order; re-inserting a key replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBundle {
    entries: Vec<(String, ShardValue)>,
}

/// One worker's partition of a [`DataBundle`]. Same keys as the source.
pub type Shard = DataBundle;

impl DataBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ShardValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a value, returning the previous value under that name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ShardValue>,
    ) -> Option<ShardValue> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ShardValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove a value and return it, keeping the order of the others.
    pub fn take(&mut self, name: &str) -> Option<ShardValue> {
        let index = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn numeric(&self, name: &str) -> Option<&[f64]> {
        self.get(name).and_then(ShardValue::as_numeric)
    }

    pub fn records(&self, name: &str) -> Option<&[serde_json::Value]> {
        self.get(name).and_then(ShardValue::as_records)
    }

    pub fn collection<C: Collection>(&self, name: &str) -> Option<&C> {
        self.get(name).and_then(ShardValue::as_collection)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ShardValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Index ranges of the contiguous rule: `n` near-equal chunks of `len`
/// elements, the first `len % n` chunks one element longer.
pub fn chunk_bounds(len: usize, n: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return Vec::new();
    }
    let base = len / n;
    let extra = len % n;
    let mut start = 0;
    (0..n)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Split a slice into `n` contiguous chunks.
pub fn split_contiguous<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    chunk_bounds(items.len(), n)
        .into_iter()
        .map(|range| items[range].to_vec())
        .collect()
}

/// Distribute items round-robin: item `i` goes to part `i % n`.
///
/// Fails when there are fewer items than parts.
pub fn split_round_robin<T: Clone>(items: &[T], n: usize) -> Result<Vec<Vec<T>>> {
    if items.len() < n {
        return Err(ForemanError::Partition(format!(
            "cannot distribute {} records across {} workers",
            items.len(),
            n
        )));
    }
    let mut parts: Vec<Vec<T>> = (0..n)
        .map(|_| Vec::with_capacity(items.len().div_ceil(n)))
        .collect();
    for (index, item) in items.iter().enumerate() {
        parts[index % n].push(item.clone());
    }
    Ok(parts)
}

/// Inverse of [`split_round_robin`].
pub fn interleave<T: Clone>(parts: &[Vec<T>]) -> Result<Vec<T>> {
    let n = parts.len();
    let total: usize = parts.iter().map(Vec::len).sum();
    for (i, part) in parts.iter().enumerate() {
        let expected = (total + n - 1 - i) / n;
        if part.len() != expected {
            return Err(ForemanError::Partition(format!(
                "round-robin part {} has {} records, expected {}",
                i,
                part.len(),
                expected
            )));
        }
    }
    Ok((0..total).map(|index| parts[index % n][index / n].clone()).collect())
}

/// Split every value of `bundle` into `n` shards.
pub fn split(bundle: &DataBundle, n: usize) -> Result<Vec<Shard>> {
    if n == 0 {
        return Err(ForemanError::Partition(
            "worker count must be at least 1".to_string(),
        ));
    }

    let mut shards: Vec<Shard> = (0..n).map(|_| Shard::new()).collect();
    for (name, value) in bundle.iter() {
        let parts: Vec<ShardValue> = match value {
            ShardValue::Numeric(values) => split_contiguous(values, n)
                .into_iter()
                .map(ShardValue::Numeric)
                .collect(),
            ShardValue::Records(records) => split_round_robin(records, n)
                .map_err(|e| ForemanError::Partition(format!("key '{}': {}", name, e)))?
                .into_iter()
                .map(ShardValue::Records)
                .collect(),
            ShardValue::Collection(collection) => {
                let parts = collection.split_boxed(n)?;
                if parts.len() != n {
                    return Err(ForemanError::Partition(format!(
                        "key '{}': collection split into {} parts instead of {}",
                        name,
                        parts.len(),
                        n
                    )));
                }
                parts.into_iter().map(ShardValue::Collection).collect()
            }
        };
        for (shard, part) in shards.iter_mut().zip(parts) {
            shard.entries.push((name.to_string(), part));
        }
    }
    Ok(shards)
}

/// Reassemble shards produced by [`split`], in shard order.
pub fn merge(shards: &[Shard]) -> Result<DataBundle> {
    let Some(first) = shards.first() else {
        return Ok(DataBundle::new());
    };
    for (i, shard) in shards.iter().enumerate().skip(1) {
        if !shard.keys().eq(first.keys()) {
            return Err(ForemanError::Partition(format!(
                "shard {} does not have the same keys as shard 0",
                i
            )));
        }
    }

    let mut merged = DataBundle::new();
    for (index, (name, value)) in first.entries.iter().enumerate() {
        let column: Vec<&ShardValue> = shards.iter().map(|s| &s.entries[index].1).collect();
        let joined = match value {
            ShardValue::Numeric(_) => {
                let mut values = Vec::new();
                for part in &column {
                    values.extend_from_slice(expect_kind(name, value, part, ShardValue::as_numeric)?);
                }
                ShardValue::Numeric(values)
            }
            ShardValue::Records(_) => {
                let parts = column
                    .iter()
                    .map(|part| {
                        expect_kind(name, value, part, ShardValue::as_records).map(<[_]>::to_vec)
                    })
                    .collect::<Result<Vec<_>>>()?;
                ShardValue::Records(interleave(&parts)?)
            }
            ShardValue::Collection(head) => {
                let rest = column[1..]
                    .iter()
                    .map(|part| match part {
                        ShardValue::Collection(c) => Ok(c.as_ref()),
                        other => Err(kind_mismatch(name, value, other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                ShardValue::Collection(head.join_boxed(&rest)?)
            }
        };
        merged.entries.push((name.clone(), joined));
    }
    Ok(merged)
}

fn expect_kind<'a, T: ?Sized>(
    name: &str,
    expected: &ShardValue,
    found: &'a ShardValue,
    view: impl Fn(&'a ShardValue) -> Option<&'a T>,
) -> Result<&'a T> {
    view(found).ok_or_else(|| kind_mismatch(name, expected, found))
}

fn kind_mismatch(name: &str, expected: &ShardValue, found: &ShardValue) -> ForemanError {
    ForemanError::Partition(format!(
        "key '{}' holds {} data in shard 0 but {} data in another shard",
        name,
        expected.kind(),
        found.kind()
    ))
}
