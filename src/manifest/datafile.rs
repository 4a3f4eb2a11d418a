use std::collections::BTreeMap;

use crate::{IcebergResult, IcebergError};
use crate::partition::PartitionValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileContent {
    Data,
    PositionDeletes,
    EqualityDeletes,
}

impl DataFileContent {
    pub(crate) fn code(&self) -> i32 {
        match self {
            DataFileContent::Data => 0,
            DataFileContent::PositionDeletes => 1,
            DataFileContent::EqualityDeletes => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> IcebergResult<Self> {
        match code {
            0 => Ok(DataFileContent::Data),
            1 => Ok(DataFileContent::PositionDeletes),
            2 => Ok(DataFileContent::EqualityDeletes),
            _ => Err(IcebergError::ManifestError(format!("invalid data file content {code}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileFormat {
    Avro,
    Orc,
    Parquet
}

impl std::fmt::Display for DataFileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            DataFileFormat::Avro => "AVRO",
            DataFileFormat::Orc => "ORC",
            DataFileFormat::Parquet => "PARQUET",
        })
    }
}

impl std::str::FromStr for DataFileFormat {
    type Err = IcebergError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVRO" => Ok(DataFileFormat::Avro),
            "ORC" => Ok(DataFileFormat::Orc),
            "PARQUET" => Ok(DataFileFormat::Parquet),
            _ => Err(IcebergError::ManifestError(format!("invalid file format '{s}'"))),
        }
    }
}

/// Points to a file containing table data, and stores partition values and statistics
/// for the data.
///
/// A `DataFile` is immutable once the file it describes has been written.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFile {
    pub content: DataFileContent,
    /// Full URI of the file.
    pub file_path: String,
    pub file_format: DataFileFormat,
    /// Partition tuple; all records in the file share it.
    pub partition: PartitionValues,
    pub record_count: i64,
    pub file_size_in_bytes: i64,
    /// Map from column id to the total size on disk of all regions that store the
    /// column.
    pub column_sizes: Option<BTreeMap<i32, i64>>,
    /// Map from column id to number of values in the column, including nulls and
    /// NaNs.
    pub value_counts: BTreeMap<i32, i64>,
    pub null_value_counts: BTreeMap<i32, i64>,
    pub nan_value_counts: BTreeMap<i32, i64>,
    /// Map from column id to the smallest non-null, non-NaN value in the column,
    /// in binary single-value serialization.
    pub lower_bounds: BTreeMap<i32, Vec<u8>>,
    /// Map from column id to the largest non-null, non-NaN value in the column.
    pub upper_bounds: BTreeMap<i32, Vec<u8>>,
    /// Offsets of the Parquet row groups, ascending.
    pub split_offsets: Option<Vec<i64>>,
    pub sort_order_id: Option<i32>,
}

impl DataFile {
    pub fn builder(
        file_path: &str,
        file_format: DataFileFormat,
        record_count: i64,
        file_size_in_bytes: i64,
    ) -> DataFileBuilder {
        DataFileBuilder::new(file_path, file_format, record_count, file_size_in_bytes)
    }
}

pub struct DataFileBuilder {
    data_file: DataFile
}

impl DataFileBuilder {
    pub fn new(
        file_path: &str,
        file_format: DataFileFormat,
        record_count: i64,
        file_size_in_bytes: i64,
    ) -> Self {
        Self {
            data_file: DataFile {
                content: DataFileContent::Data,
                file_path: file_path.to_string(),
                file_format,
                partition: PartitionValues::default(),
                record_count,
                file_size_in_bytes,
                column_sizes: None,
                value_counts: BTreeMap::new(),
                null_value_counts: BTreeMap::new(),
                nan_value_counts: BTreeMap::new(),
                lower_bounds: BTreeMap::new(),
                upper_bounds: BTreeMap::new(),
                split_offsets: None,
                sort_order_id: None,
            }
        }
    }

    /// All records in the file must have these partition values.
    pub fn with_partition_values(mut self, partition_values: PartitionValues) -> Self {
        self.data_file.partition = partition_values;
        self
    }

    pub fn with_column_sizes(mut self, column_sizes: BTreeMap<i32, i64>) -> Self {
        self.data_file.column_sizes = Some(column_sizes);
        self
    }

    pub fn with_value_counts(
        mut self,
        value_counts: BTreeMap<i32, i64>,
        null_value_counts: BTreeMap<i32, i64>,
        nan_value_counts: BTreeMap<i32, i64>,
    ) -> Self {
        self.data_file.value_counts = value_counts;
        self.data_file.null_value_counts = null_value_counts;
        self.data_file.nan_value_counts = nan_value_counts;
        self
    }

    pub fn with_bounds(
        mut self,
        lower_bounds: BTreeMap<i32, Vec<u8>>,
        upper_bounds: BTreeMap<i32, Vec<u8>>,
    ) -> Self {
        self.data_file.lower_bounds = lower_bounds;
        self.data_file.upper_bounds = upper_bounds;
        self
    }

    pub fn with_split_offsets(mut self, split_offsets: Vec<i64>) -> Self {
        self.data_file.split_offsets = Some(split_offsets);
        self
    }

    pub fn with_sort_order_id(mut self, sort_order_id: i32) -> Self {
        self.data_file.sort_order_id = Some(sort_order_id);
        self
    }

    pub fn build(self) -> DataFile {
        self.data_file
    }
}
