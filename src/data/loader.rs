use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Float64Builder, Int32Array,
    Int64Array, LargeListArray, ListArray, ListBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::{Array2, Array3};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::model::{Mask3D, SampleMatrix, Volume4D};

// ---------------------------------------------------------------------------
// Voxel table – the on-disk layout shared by every format
// ---------------------------------------------------------------------------

/// One row of a voxel table.
#[derive(Debug, Clone, PartialEq)]
struct VoxelRecord {
    coord: [usize; 3],
    signal: Option<Vec<f64>>,
    value: Option<f64>,
}

/// Parsed file contents before they become a volume or a mask.
#[derive(Debug, Clone, Default)]
struct VoxelTable {
    shape: Option<[usize; 3]>,
    voxels: Vec<VoxelRecord>,
}

impl VoxelTable {
    /// Explicit shape if the file had one, else `max index + 1` per axis.
    fn shape(&self) -> Result<[usize; 3]> {
        let inferred = self.voxels.iter().fold([0usize; 3], |acc, v| {
            [
                acc[0].max(v.coord[0] + 1),
                acc[1].max(v.coord[1] + 1),
                acc[2].max(v.coord[2] + 1),
            ]
        });
        match self.shape {
            Some(shape) => {
                if inferred.iter().zip(shape.iter()).any(|(i, s)| i > s) {
                    bail!("voxel coordinates exceed declared shape {shape:?}");
                }
                Ok(shape)
            }
            None => {
                if self.voxels.is_empty() {
                    bail!("voxel table is empty and declares no shape");
                }
                Ok(inferred)
            }
        }
    }

    fn into_volume(self) -> Result<Volume4D> {
        let shape = self.shape()?;
        let n_samples = match self.voxels.iter().find_map(|v| v.signal.as_ref()) {
            Some(signal) => signal.len(),
            None => bail!("voxel table has no 'signal' column"),
        };
        if n_samples == 0 {
            bail!("voxel signals are empty");
        }

        let mut volume = Volume4D::zeros(shape, n_samples);
        let data = volume.data_mut();
        for (row, voxel) in self.voxels.iter().enumerate() {
            let signal = voxel
                .signal
                .as_ref()
                .with_context(|| format!("Row {row}: missing 'signal'"))?;
            if signal.len() != n_samples {
                bail!(
                    "Row {row}: signal has {} values but the first row has {n_samples}",
                    signal.len()
                );
            }
            let [i, j, k] = voxel.coord;
            for (t, &v) in signal.iter().enumerate() {
                data[[i, j, k, t]] = v;
            }
        }
        Ok(volume)
    }

    fn into_mask(self) -> Result<Mask3D> {
        let shape = self.shape()?;
        let mut data = Array3::from_elem((shape[0], shape[1], shape[2]), false);
        for voxel in &self.voxels {
            let selected = match (&voxel.value, &voxel.signal) {
                (Some(v), _) => *v != 0.0,
                (None, Some(s)) if !s.is_empty() => s.iter().any(|&x| x != 0.0),
                _ => true,
            };
            let [i, j, k] = voxel.coord;
            data[[i, j, k]] = selected;
        }
        Ok(Mask3D::new(data))
    }
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a 4-D volume from a voxel table.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – integer columns `i`, `j`, `k` and a `signal` list column
/// * `.json`    – `[{ "i": 0, "j": 1, "k": 2, "signal": [...] }, ...]`, or
///   `{ "shape": [nx, ny, nz], "voxels": [...] }`
/// * `.csv`     – columns `i`, `j`, `k`, `signal` (semicolon-separated floats)
///
/// Voxels absent from the table are zero.
pub fn load_volume(path: &Path) -> Result<Volume4D> {
    let table = load_table(path)?;
    let volume = table
        .into_volume()
        .with_context(|| format!("building volume from {}", path.display()))?;
    log::info!(
        "loaded volume {:?} x {} samples from {}",
        volume.shape3(),
        volume.n_samples(),
        path.display()
    );
    Ok(volume)
}

/// Load a mask from a voxel table.
///
/// Listed voxels are selected unless their `value` is zero/false or their
/// `signal` is all zeros. The `signal` column is optional here.
pub fn load_mask(path: &Path) -> Result<Mask3D> {
    let mask = load_table(path)?
        .into_mask()
        .with_context(|| format!("building mask from {}", path.display()))?;
    log::info!(
        "loaded mask {:?} with {} voxels from {}",
        mask.shape(),
        mask.count(),
        path.display()
    );
    Ok(mask)
}

/// Write a volume as a voxel table.  Dispatch by extension.
///
/// With a mask only the masked voxels are written, otherwise every voxel
/// whose signal is not all zeros.
pub fn save_volume(volume: &Volume4D, mask: Option<&Mask3D>, path: &Path) -> Result<()> {
    if let Some(mask) = mask {
        if mask.shape() != volume.shape3() {
            bail!(
                "mask shape {:?} does not match volume shape {:?}",
                mask.shape(),
                volume.shape3()
            );
        }
    }
    let rows = volume_rows(volume, mask);
    match extension(path).as_str() {
        "parquet" | "pq" => save_parquet(&rows, path),
        "json" => save_json(volume.shape3(), &rows, path),
        "csv" => save_csv(&rows, path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn load_table(path: &Path) -> Result<VoxelTable> {
    match extension(path).as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

fn volume_rows(volume: &Volume4D, mask: Option<&Mask3D>) -> Vec<([usize; 3], Vec<f64>)> {
    let data = volume.data();
    let signal_at = |[i, j, k]: [usize; 3]| -> Vec<f64> {
        (0..volume.n_samples()).map(|t| data[[i, j, k, t]]).collect()
    };
    match mask {
        Some(mask) => mask
            .voxel_coords()
            .into_iter()
            .map(|c| (c, signal_at(c)))
            .collect(),
        None => Mask3D::full(volume.shape3())
            .voxel_coords()
            .into_iter()
            .map(|c| (c, signal_at(c)))
            .filter(|(_, s)| s.iter().any(|&v| v != 0.0))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn load_json(path: &Path) -> Result<VoxelTable> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let (shape, records) = match &root {
        JsonValue::Array(records) => (None, records),
        JsonValue::Object(obj) => {
            let shape = match obj.get("shape") {
                Some(v) => Some(json_shape(v)?),
                None => None,
            };
            let records = obj
                .get("voxels")
                .and_then(|v| v.as_array())
                .context("Expected a 'voxels' array")?;
            (shape, records)
        }
        _ => bail!("Expected a top-level JSON array or object"),
    };

    let mut voxels = Vec::with_capacity(records.len());
    for (row, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {row} is not a JSON object"))?;

        let coord = [
            json_index(obj.get("i"), row, "i")?,
            json_index(obj.get("j"), row, "j")?,
            json_index(obj.get("k"), row, "k")?,
        ];
        let signal = match obj.get("signal") {
            Some(v) => Some(json_array_to_f64(v, row, "signal")?),
            None => None,
        };
        let value = match obj.get("value") {
            Some(JsonValue::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            Some(v) => Some(
                v.as_f64()
                    .with_context(|| format!("Row {row}: 'value' is not a number"))?,
            ),
            None => None,
        };
        voxels.push(VoxelRecord {
            coord,
            signal,
            value,
        });
    }

    Ok(VoxelTable { shape, voxels })
}

fn json_shape(val: &JsonValue) -> Result<[usize; 3]> {
    let arr = val.as_array().context("'shape' must be an array")?;
    if arr.len() != 3 {
        bail!("'shape' must have 3 entries, got {}", arr.len());
    }
    let mut shape = [0usize; 3];
    for (d, v) in arr.iter().enumerate() {
        shape[d] = v
            .as_u64()
            .with_context(|| format!("shape[{d}] is not a non-negative integer"))?
            as usize;
    }
    Ok(shape)
}

fn json_index(val: Option<&JsonValue>, row: usize, col: &str) -> Result<usize> {
    val.and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .with_context(|| format!("Row {row}: missing or invalid '{col}'"))
}

fn json_array_to_f64(val: &JsonValue, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .as_array()
        .with_context(|| format!("Row {row}: '{col}' is not an array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
        })
        .collect()
}

#[derive(Serialize)]
struct JsonVoxel<'a> {
    i: usize,
    j: usize,
    k: usize,
    signal: &'a [f64],
}

#[derive(Serialize)]
struct JsonVolume<'a> {
    shape: [usize; 3],
    voxels: Vec<JsonVoxel<'a>>,
}

fn save_json(shape: [usize; 3], rows: &[([usize; 3], Vec<f64>)], path: &Path) -> Result<()> {
    let doc = JsonVolume {
        shape,
        voxels: rows
            .iter()
            .map(|([i, j, k], signal)| JsonVoxel {
                i: *i,
                j: *j,
                k: *k,
                signal,
            })
            .collect(),
    };
    let file = std::fs::File::create(path).context("creating JSON file")?;
    serde_json::to_writer(std::io::BufWriter::new(file), &doc).context("writing JSON")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// CSV layout:  header row with column names.
/// `signal` contains semicolon-separated floats: `"12.0;14.5;11.0"`.
/// `value` is optional and only used for masks.
fn load_csv(path: &Path) -> Result<VoxelTable> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let column = |name: &str| headers.iter().position(|h| h == name);
    let i_idx = column("i").context("CSV missing 'i' column")?;
    let j_idx = column("j").context("CSV missing 'j' column")?;
    let k_idx = column("k").context("CSV missing 'k' column")?;
    let signal_idx = column("signal");
    let value_idx = column("value");

    let mut voxels = Vec::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let index = |idx: usize, col: &str| -> Result<usize> {
            let s = record.get(idx).unwrap_or("").trim();
            s.parse::<usize>()
                .with_context(|| format!("Row {row_no}, {col}: '{s}' is not an index"))
        };
        let coord = [index(i_idx, "i")?, index(j_idx, "j")?, index(k_idx, "k")?];

        let signal = match signal_idx.and_then(|idx| record.get(idx)) {
            Some(s) if !s.trim().is_empty() => Some(parse_semicolon_floats(s, row_no, "signal")?),
            _ => None,
        };
        let value = match value_idx.and_then(|idx| record.get(idx)) {
            Some(s) if !s.trim().is_empty() => Some(parse_value(s.trim(), row_no)?),
            _ => None,
        };

        voxels.push(VoxelRecord {
            coord,
            signal,
            value,
        });
    }

    Ok(VoxelTable {
        shape: None,
        voxels,
    })
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

fn parse_value(s: &str, row: usize) -> Result<f64> {
    match s {
        "true" => Ok(1.0),
        "false" => Ok(0.0),
        _ => s
            .parse::<f64>()
            .with_context(|| format!("Row {row}, value: '{s}' is not a number")),
    }
}

fn save_csv(rows: &[([usize; 3], Vec<f64>)], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;
    writer.write_record(["i", "j", "k", "signal"])?;
    for ([i, j, k], signal) in rows {
        let joined = signal
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(";");
        writer.write_record([i.to_string(), j.to_string(), k.to_string(), joined])?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sample matrices (reduced data)
// ---------------------------------------------------------------------------

/// Write a `(samples × features)` matrix as CSV with header
/// `{prefix}_0, {prefix}_1, ...`, one row per sample.
pub fn save_matrix(matrix: &SampleMatrix, prefix: &str, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;
    writer.write_record((0..matrix.ncols()).map(|c| format!("{prefix}_{c}")))?;
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

/// Read a matrix written by [`save_matrix`]. The header is skipped.
pub fn load_matrix(path: &Path) -> Result<SampleMatrix> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let n_cols = reader.headers().context("reading CSV headers")?.len();

    let mut values = Vec::new();
    let mut n_rows = 0;
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        if record.len() != n_cols {
            bail!("CSV row {row_no}: {} fields, header has {n_cols}", record.len());
        }
        for (col, field) in record.iter().enumerate() {
            let v = field
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row_no}, column {col}: '{field}' is not a number"))?;
            values.push(v);
        }
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols), values).context("assembling matrix")
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

/// Expected schema:
/// - `i`, `j`, `k`: Int32 or Int64 voxel coordinates
/// - `signal`: List<Float64|Float32> or LargeList<..> (optional for masks)
/// - `value`: numeric or Boolean (optional, masks only)
fn load_parquet(path: &Path) -> Result<VoxelTable> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut voxels = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;

        let i_col = column(&batch, "i")?;
        let j_col = column(&batch, "j")?;
        let k_col = column(&batch, "k")?;
        let signal_col = column(&batch, "signal").ok();
        let value_col = column(&batch, "value").ok();
        // Row numbers in messages count from the start of the file.
        let offset = voxels.len();

        for row in 0..batch.num_rows() {
            let line = offset + row;
            let coord = [
                extract_index(i_col, row).with_context(|| format!("Row {line}: 'i'"))?,
                extract_index(j_col, row).with_context(|| format!("Row {line}: 'j'"))?,
                extract_index(k_col, row).with_context(|| format!("Row {line}: 'k'"))?,
            ];
            let signal = match signal_col {
                Some(col) => Some(
                    extract_f64_list(col, row)
                        .with_context(|| format!("Row {line}: failed to read 'signal'"))?,
                ),
                None => None,
            };
            let value = match value_col {
                Some(col) => extract_scalar(col, row)
                    .with_context(|| format!("Row {line}: failed to read 'value'"))?,
                None => None,
            };
            voxels.push(VoxelRecord {
                coord,
                signal,
                value,
            });
        }
    }

    Ok(VoxelTable {
        shape: None,
        voxels,
    })
}

// -- Parquet / Arrow helpers --

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| anyhow::anyhow!("Parquet file missing '{name}' column"))?;
    Ok(batch.column(idx))
}

fn extract_index(col: &ArrayRef, row: usize) -> Result<usize> {
    if col.is_null(row) {
        bail!("null coordinate");
    }
    let v = match col.data_type() {
        DataType::Int32 => {
            let arr = col
                .as_any()
                .downcast_ref::<Int32Array>()
                .context("expected Int32Array")?;
            arr.value(row) as i64
        }
        DataType::Int64 => {
            let arr = col
                .as_any()
                .downcast_ref::<Int64Array>()
                .context("expected Int64Array")?;
            arr.value(row)
        }
        other => bail!("Expected Int32 or Int64 coordinate column, got {other:?}"),
    };
    usize::try_from(v).with_context(|| format!("negative coordinate {v}"))
}

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &ArrayRef, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    // The inner array can be Float64 or Float32
    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}

fn extract_scalar(col: &ArrayRef, row: usize) -> Result<Option<f64>> {
    if col.is_null(row) {
        return Ok(None);
    }
    let any = col.as_any();
    let v = match col.data_type() {
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| if a.value(row) { 1.0 } else { 0.0 }),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| a.value(row) as f64),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| a.value(row) as f64),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| a.value(row) as f64),
        DataType::Float64 => any.downcast_ref::<Float64Array>().map(|a| a.value(row)),
        other => bail!("Unsupported 'value' column type {other:?}"),
    };
    v.map(Some).context("column type does not match its declared data type")
}

fn save_parquet(rows: &[([usize; 3], Vec<f64>)], path: &Path) -> Result<()> {
    let coord_array = |axis: usize| -> Int64Array {
        rows.iter().map(|(c, _)| c[axis] as i64).collect::<Vec<_>>().into()
    };

    let mut signal_builder = ListBuilder::new(Float64Builder::new());
    for (_, signal) in rows {
        let values = signal_builder.values();
        for &v in signal {
            values.append_value(v);
        }
        signal_builder.append(true);
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("i", DataType::Int64, false),
        Field::new("j", DataType::Int64, false),
        Field::new("k", DataType::Int64, false),
        Field::new(
            "signal",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            false,
        ),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(coord_array(0)) as ArrayRef,
            Arc::new(coord_array(1)) as ArrayRef,
            Arc::new(coord_array(2)) as ArrayRef,
            Arc::new(signal_builder.finish()) as ArrayRef,
        ],
    )
    .context("building record batch")?;

    let file = std::fs::File::create(path).context("creating parquet file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}
