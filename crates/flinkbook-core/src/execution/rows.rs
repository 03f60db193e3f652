use std::sync::Arc;

use crate::gateway::Row;

/// Append-only row storage shared between snapshots.
///
/// Rows are kept as immutable chunks, one per received page. Cloning copies
/// the chunk pointers, never the rows themselves.
#[derive(Debug, Clone, Default)]
pub struct ResultRows {
    chunks: Vec<Arc<[Row]>>,
    len: usize,
}

impl ResultRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, mut index: usize) -> Option<&Row> {
        for chunk in &self.chunks {
            if index < chunk.len() {
                return chunk.get(index);
            }
            index -= chunk.len();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    pub fn chunks(&self) -> &[Arc<[Row]>] {
        &self.chunks
    }

    pub fn append(&mut self, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        self.len += rows.len();
        self.chunks.push(Arc::from(rows));
    }
}

impl PartialEq for ResultRows {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl From<Vec<Row>> for ResultRows {
    fn from(rows: Vec<Row>) -> Self {
        let mut result = Self::new();
        result.append(rows);
        result
    }
}

impl FromIterator<Row> for ResultRows {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<'a> IntoIterator for &'a ResultRows {
    type Item = &'a Row;
    type IntoIter = Box<dyn Iterator<Item = &'a Row> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(|i| Row::insert(vec![json!(i)])).collect()
    }

    #[test]
    fn test_indexing_spans_chunks() {
        let mut buffer = ResultRows::new();
        buffer.append(rows(0..2));
        buffer.append(Vec::new());
        buffer.append(rows(2..5));

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.chunks().len(), 2);
        assert_eq!(buffer.get(3), Some(&Row::insert(vec![json!(3)])));
        assert_eq!(buffer.get(5), None);
        let values: Vec<_> = buffer.iter().map(|row| row.fields[0].clone()).collect();
        assert_eq!(values, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_equality_ignores_chunk_boundaries() {
        let mut split = ResultRows::new();
        split.append(rows(0..1));
        split.append(rows(1..3));
        assert_eq!(split, ResultRows::from(rows(0..3)));
        assert_ne!(split, ResultRows::from(rows(0..2)));
    }
}
