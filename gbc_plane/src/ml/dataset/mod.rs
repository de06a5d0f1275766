use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{EncoderError, LayerValues, NodeValue};

pub use batch::{Batch, BatchSamplingStrategy, BatchSource, DataLoader};
pub use table::{DataTable, TableSelector};

pub mod batch;
pub mod table;

/// One subject: a feature vector paired with its target scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    inputs: LayerValues,
    targets: LayerValues,
}

impl Record {
    pub fn new(inputs: LayerValues, targets: LayerValues) -> Self {
        Self { inputs, targets }
    }

    pub fn inputs(&self) -> &LayerValues {
        &self.inputs
    }

    pub fn targets(&self) -> &LayerValues {
        &self.targets
    }
}

/// Immutable collection of records that all share one input width and one
/// target width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    records: Vec<Record>,
    input_columns: Vec<String>,
    target_columns: Vec<String>,
}

impl SampleSet {
    /// Splits a table into inputs and targets. Dropped columns are removed,
    /// columns matching the target pattern become targets and every other
    /// column becomes an input, in table order. The table itself is not
    /// modified.
    pub fn from_table(table: &DataTable, selector: &TableSelector) -> Result<Self> {
        let headers = table.headers();
        if let Some(missing) = selector
            .drop_columns()
            .iter()
            .find(|x| table.column_index(x).is_none())
        {
            Err(EncoderError::invalid_table(format!(
                "drop column '{missing}' not found"
            )))?;
        }

        let kept = headers
            .iter()
            .enumerate()
            .filter(|(_, name)| !selector.is_dropped(name));
        let (target_idx, input_idx): (Vec<_>, Vec<_>) =
            kept.partition(|(_, name)| selector.is_target(name));

        if target_idx.is_empty() {
            Err(EncoderError::invalid_table(format!(
                "no target columns match pattern '{}'",
                selector.target_pattern()
            )))?;
        }
        if input_idx.is_empty() {
            Err(EncoderError::invalid_table("no input columns remain"))?;
        }

        let parse_cells = |row_idx: usize, row: &[String], columns: &[(usize, &String)]| {
            columns
                .iter()
                .map(|&(col_idx, name)| {
                    let cell = &row[col_idx];
                    cell.parse::<NodeValue>().map_err(|_| {
                        EncoderError::invalid_table(format!(
                            "row {row_idx}, column '{name}': '{cell}' is not a number"
                        ))
                    })
                })
                .collect::<Result<LayerValues, _>>()
        };

        let records = table
            .rows()
            .enumerate()
            .map(|(row_idx, row)| -> Result<Record> {
                let inputs = parse_cells(row_idx, row, &input_idx)?;
                let targets = parse_cells(row_idx, row, &target_idx)?;
                Ok(Record::new(inputs, targets))
            })
            .collect::<Result<Vec<_>>>()?;

        let sample_set = Self {
            records,
            input_columns: input_idx.into_iter().map(|(_, x)| x.clone()).collect(),
            target_columns: target_idx.into_iter().map(|(_, x)| x.clone()).collect(),
        };

        info!(
            "Loaded {} samples with {} inputs and {} targets",
            sample_set.len(),
            sample_set.input_width(),
            sample_set.target_width()
        );
        Ok(sample_set)
    }

    /// Pairs already separated input and target rows by position.
    pub fn from_arrays<I, T>(inputs: &[I], targets: &[T]) -> Result<Self>
    where
        I: AsRef<[NodeValue]>,
        T: AsRef<[NodeValue]>,
    {
        if inputs.len() != targets.len() {
            Err(EncoderError::shape_mismatch(
                "sample count",
                inputs.len(),
                targets.len(),
            ))?;
        }

        let input_width = inputs.first().map(|x| x.as_ref().len()).unwrap_or_default();
        let target_width = targets.first().map(|x| x.as_ref().len()).unwrap_or_default();

        if !inputs.is_empty() && (input_width == 0 || target_width == 0) {
            Err(EncoderError::invalid_table(
                "records need at least one input and one target value",
            ))?;
        }

        let records = inputs
            .iter()
            .zip(targets)
            .map(|(x, y)| -> Result<Record> {
                let (x, y) = (x.as_ref(), y.as_ref());
                if x.len() != input_width {
                    Err(EncoderError::shape_mismatch("input row", input_width, x.len()))?;
                }
                if y.len() != target_width {
                    Err(EncoderError::shape_mismatch("target row", target_width, y.len()))?;
                }
                Ok(Record::new(x.into(), y.into()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            records,
            input_columns: (0..input_width).map(|i| format!("input_{i}")).collect(),
            target_columns: (0..target_width).map(|i| format!("target_{i}")).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Record> {
        let len = self.len();
        Ok(self
            .records
            .get(index)
            .ok_or(EncoderError::IndexOutOfRange { index, len })?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn input_width(&self) -> usize {
        self.input_columns.len()
    }

    pub fn target_width(&self) -> usize {
        self.target_columns.len()
    }

    pub fn input_columns(&self) -> &[String] {
        &self.input_columns
    }

    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// All input rows in record order, without targets.
    pub fn inputs(&self) -> Vec<Vec<NodeValue>> {
        self.records.iter().map(|x| x.inputs.to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn gbc_table(rows: usize) -> DataTable {
        let headers = ["id", "Group"]
            .into_iter()
            .map(String::from)
            .chain((0..718).map(|i| format!("gbc_{i}")))
            .chain((0..30).map(|i| format!("PANSS_{i}")))
            .collect::<Vec<_>>();

        let rows = (0..rows)
            .map(|row| {
                [format!("subj_{row}"), "SZ".to_string()]
                    .into_iter()
                    .chain((0..718).map(|i| format!("{}", row as f64 + i as f64 / 1000.0)))
                    .chain((0..30).map(|i| format!("{}", i + 1)))
                    .collect()
            })
            .collect();

        DataTable::new(headers, rows).unwrap()
    }

    #[test]
    fn builds_gbc_sample_set_without_id_or_group() {
        let table = gbc_table(5);
        let samples = SampleSet::from_table(&table, &TableSelector::default()).unwrap();

        assert_eq!(5, samples.len());
        assert_eq!(718, samples.input_width());
        assert_eq!(30, samples.target_width());

        let first = samples.get(0).unwrap();
        assert_eq!(718, first.inputs().len());
        assert_eq!(30, first.targets().len());
        assert_eq!(0.0, first.inputs()[0]);
        assert_eq!(0.717, first.inputs()[717]);
        assert_eq!(1.0, first.targets()[0]);
        assert_eq!(30.0, first.targets()[29]);

        assert!(samples
            .input_columns()
            .iter()
            .all(|x| x != "id" && x != "Group" && !x.contains("PANSS")));
        assert!(samples.target_columns().iter().all(|x| x.contains("PANSS")));
    }

    #[test]
    fn get_past_end_is_out_of_range() {
        let table = gbc_table(5);
        let samples = SampleSet::from_table(&table, &TableSelector::default()).unwrap();

        let err = samples.get(5).unwrap_err();
        assert_eq!(
            Some(&EncoderError::IndexOutOfRange { index: 5, len: 5 }),
            err.downcast_ref::<EncoderError>()
        );
    }

    #[test]
    fn building_from_table_leaves_table_untouched() {
        let table = gbc_table(2);
        let before = table.clone();

        SampleSet::from_table(&table, &TableSelector::default()).unwrap();
        let again = SampleSet::from_table(&table, &TableSelector::default()).unwrap();

        assert_eq!(before, table);
        assert_eq!(718, again.input_width());
    }

    #[test]
    fn rejects_non_numeric_cells_with_location() {
        let headers = vec!["id", "x", "PANSS_1"]
            .into_iter()
            .map(String::from)
            .collect();
        let rows = vec![vec!["a".into(), "1.0".into(), "n/a".into()]];
        let table = DataTable::new(headers, rows).unwrap();

        let selector = TableSelector::default().with_drop_columns(vec!["id".into()]);
        let err = SampleSet::from_table(&table, &selector).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("row 0"), "{message}");
        assert!(message.contains("PANSS_1"), "{message}");
    }

    #[test]
    fn rejects_missing_drop_column_and_missing_targets() {
        let headers = vec!["id", "x", "y"].into_iter().map(String::from).collect();
        let table = DataTable::new(headers, vec![]).unwrap();

        assert!(SampleSet::from_table(&table, &TableSelector::default()).is_err());

        let selector = TableSelector::new(vec!["id".into()], "PANSS");
        let err = SampleSet::from_table(&table, &selector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EncoderError>(),
            Some(EncoderError::InvalidTable(_))
        ));
    }

    #[test]
    fn custom_target_pattern_selects_other_scores() {
        let headers = vec!["x0", "x1", "score_a", "score_b"]
            .into_iter()
            .map(String::from)
            .collect();
        let rows = vec![vec!["1".into(), "2".into(), "3".into(), "4".into()]];
        let table = DataTable::new(headers, rows).unwrap();

        let selector = TableSelector::default()
            .with_drop_columns(vec![])
            .with_target_pattern("score");
        let samples = SampleSet::from_table(&table, &selector).unwrap();

        assert_eq!(vec!["x0", "x1"], samples.input_columns());
        assert_eq!(vec![3.0, 4.0], **samples.get(0).unwrap().targets());
    }

    #[test]
    fn from_arrays_pairs_rows() {
        let inputs = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let targets = vec![vec![0.5], vec![1.5]];

        let samples = SampleSet::from_arrays(&inputs, &targets).unwrap();

        assert_eq!(2, samples.len());
        assert_eq!(2, samples.input_width());
        assert_eq!(1, samples.target_width());
        assert_eq!(inputs, samples.inputs());
        assert_eq!(vec![1.5], **samples.get(1).unwrap().targets());
    }

    #[test]
    fn from_arrays_rejects_ragged_rows() {
        let inputs = vec![vec![1.0, 2.0], vec![3.0]];
        let targets = vec![vec![0.5], vec![1.5]];

        let err = SampleSet::from_arrays(&inputs, &targets).unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch("input row", 2, 1)),
            err.downcast_ref::<EncoderError>()
        );

        let err = SampleSet::from_arrays(&inputs[..1], &targets).unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch("sample count", 1, 2)),
            err.downcast_ref::<EncoderError>()
        );
    }

    #[test]
    fn empty_arrays_make_empty_set() {
        let empty: Vec<Vec<NodeValue>> = vec![];
        let samples = SampleSet::from_arrays(&empty, &empty).unwrap();

        assert!(samples.is_empty());
        assert!(samples.get(0).is_err());
    }
}
