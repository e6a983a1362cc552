/*!
# Append-only CSV stores for sampler output

One record stream per chain (MCMC) or one weighted-draw stream plus one
mixture-component stream (PMC). Records are appended in fixed-size chunks;
one chunk is one durable write (flush + fsync), so a crash loses at most the
chunk that was being written.

Sample stream layout: a header row `chain,iteration,log_posterior,weight`
followed by one `par_<i>` column per parameter, then one row per record.
Component stream layout: `weight,dof`, `mean_<i>` per dimension and the
row-major covariance columns `cov_<i>_<j>`.
*/

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{Reader, Writer};

use crate::error::{Error, Result};
use crate::mixture::{MixtureComponent, MixtureModel};

/// One persisted sample: parameter point, log-posterior, importance weight
/// (1.0 for MCMC records), owning chain/group id and iteration index.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub chain: u32,
    pub iteration: u64,
    pub point: Vec<f64>,
    pub log_posterior: f64,
    pub weight: f64,
}

/// Append-only writer for one record stream. Exactly one `SampleStore` owns
/// a stream at a time; that ownership serializes chunk commits.
pub struct SampleStore {
    path: PathBuf,
    writer: Writer<File>,
    sync: File,
    dimension: usize,
}

impl SampleStore {
    /// Creates (truncating) the stream and durably writes the header.
    pub fn create(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::store(&path, e))?;
        let sync = file.try_clone().map_err(|e| Error::store(&path, e))?;
        let mut writer = Writer::from_writer(file);

        let mut header = vec![
            "chain".to_string(),
            "iteration".to_string(),
            "log_posterior".to_string(),
            "weight".to_string(),
        ];
        header.extend((0..dimension).map(|i| format!("par_{i}")));
        writer
            .write_record(&header)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| Error::store(&path, e))?;
        sync.sync_all().map_err(|e| Error::store(&path, e))?;

        Ok(Self {
            path,
            writer,
            sync,
            dimension,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one chunk of records as a single durable write.
    pub fn append_chunk(&mut self, records: &[SampleRecord]) -> Result<()> {
        for record in records {
            if record.point.len() != self.dimension {
                return Err(Error::store(
                    &self.path,
                    format!(
                        "record has {} parameters, store expects {}",
                        record.point.len(),
                        self.dimension
                    ),
                ));
            }
            let mut row = vec![
                record.chain.to_string(),
                record.iteration.to_string(),
                record.log_posterior.to_string(),
                record.weight.to_string(),
            ];
            row.extend(record.point.iter().map(|v| v.to_string()));
            self.writer
                .write_record(&row)
                .map_err(|e| Error::store(&self.path, e))?;
        }
        self.writer.flush().map_err(|e| Error::store(&self.path, e))?;
        self.sync.sync_data().map_err(|e| Error::store(&self.path, e))
    }
}

/// Reads records `[min, max)` from a stream; `max = None` reads to the end.
/// A malformed row (for instance the tail of a chunk that never committed)
/// is a store error.
pub fn read_records(
    path: impl AsRef<Path>,
    min: usize,
    max: Option<usize>,
) -> Result<Vec<SampleRecord>> {
    let path = path.as_ref();
    let mut reader = Reader::from_path(path).map_err(|e| Error::store(path, e))?;
    let headers = reader.headers().map_err(|e| Error::store(path, e))?;
    if headers.len() < 4 {
        return Err(Error::store(path, "missing sample stream header"));
    }
    let dimension = headers.len() - 4;

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        if index < min {
            continue;
        }
        if let Some(max) = max {
            if index >= max {
                break;
            }
        }
        let row = row.map_err(|e| Error::store(path, e))?;
        if row.len() != dimension + 4 {
            return Err(Error::store(
                path,
                format!("partial record at row {index}"),
            ));
        }
        let parse = |field: &str| -> Result<f64> {
            field
                .parse::<f64>()
                .map_err(|_| Error::store(path, format!("malformed value at row {index}")))
        };
        let chain = row[0]
            .parse::<u32>()
            .map_err(|_| Error::store(path, format!("malformed chain id at row {index}")))?;
        let iteration = row[1]
            .parse::<u64>()
            .map_err(|_| Error::store(path, format!("malformed iteration at row {index}")))?;
        let log_posterior = parse(&row[2])?;
        let weight = parse(&row[3])?;
        let point = row
            .iter()
            .skip(4)
            .map(parse)
            .collect::<Result<Vec<f64>>>()?;
        records.push(SampleRecord {
            chain,
            iteration,
            point,
            log_posterior,
            weight,
        });
    }
    Ok(records)
}

/// Durably writes the mixture-component stream.
pub fn write_components(path: impl AsRef<Path>, model: &MixtureModel) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::store(path, e))?;
    let sync = file.try_clone().map_err(|e| Error::store(path, e))?;
    let mut writer = Writer::from_writer(file);
    let dim = model.dimension();

    let mut header = vec!["weight".to_string(), "dof".to_string()];
    header.extend((0..dim).map(|i| format!("mean_{i}")));
    for i in 0..dim {
        header.extend((0..dim).map(|j| format!("cov_{i}_{j}")));
    }
    writer
        .write_record(&header)
        .map_err(|e| Error::store(path, e))?;

    for component in model.components() {
        let mut row = vec![component.weight.to_string(), component.dof.to_string()];
        row.extend(component.mean.iter().map(|v| v.to_string()));
        for i in 0..dim {
            row.extend((0..dim).map(|j| component.cov[(i, j)].to_string()));
        }
        writer.write_record(&row).map_err(|e| Error::store(path, e))?;
    }
    writer.flush().map_err(|e| Error::store(path, e))?;
    sync.sync_all().map_err(|e| Error::store(path, e))
}

/// Reads a mixture-component stream back into a model.
pub fn read_components(path: impl AsRef<Path>) -> Result<MixtureModel> {
    let path = path.as_ref();
    let mut reader = Reader::from_path(path).map_err(|e| Error::store(path, e))?;
    let columns = reader.headers().map_err(|e| Error::store(path, e))?.len();
    // Columns: 2 + dim + dim^2.
    let extra = columns.saturating_sub(2);
    let dim = (0..=extra)
        .find(|d| d + d * d == extra)
        .ok_or_else(|| Error::store(path, "component header has inconsistent column count"))?;
    if dim == 0 {
        return Err(Error::store(path, "component stream has no dimensions"));
    }

    let mut components = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| Error::store(path, e))?;
        if row.len() != columns {
            return Err(Error::store(
                path,
                format!("partial component at row {index}"),
            ));
        }
        let values = row
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|_| {
                    Error::store(path, format!("malformed component value at row {index}"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        let weight = values[0];
        let dof = values[1];
        let mean = nalgebra::DVector::from_column_slice(&values[2..2 + dim]);
        let cov = nalgebra::DMatrix::from_row_slice(dim, dim, &values[2 + dim..]);
        components.push(MixtureComponent::new(mean, cov, weight, dof)?);
    }
    MixtureModel::new(components)
}
