use std::fs;

use rusty_rena::data::loader::{load_mask, load_matrix, load_volume, save_matrix, save_volume};
use rusty_rena::data::synthetic::generate_fake_fmri;
use rusty_rena::{Mask3D, ReNA, VolumeMasker};
use tempfile::tempdir;

#[test]
fn test_load_json_records() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("volume.json");
    fs::write(
        &path,
        r#"[
            { "i": 0, "j": 0, "k": 0, "signal": [1.0, 2.0] },
            { "i": 1, "j": 2, "k": 0, "signal": [3.0, 4.0] }
        ]"#,
    )?;

    let volume = load_volume(&path)?;
    assert_eq!(volume.shape3(), [2, 3, 1]);
    assert_eq!(volume.n_samples(), 2);
    assert_eq!(volume.data()[[1, 2, 0, 1]], 4.0);
    assert_eq!(volume.data()[[0, 1, 0, 0]], 0.0);
    Ok(())
}

#[test]
fn test_load_json_with_shape() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("volume.json");
    fs::write(
        &path,
        r#"{ "shape": [4, 4, 4], "voxels": [ { "i": 1, "j": 1, "k": 1, "signal": [5.0] } ] }"#,
    )?;

    let volume = load_volume(&path)?;
    assert_eq!(volume.shape3(), [4, 4, 4]);
    Ok(())
}

#[test]
fn test_load_csv_volume_and_mask() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let volume_path = dir.path().join("volume.csv");
    fs::write(
        &volume_path,
        "i,j,k,signal\n0,0,0,1.0;2.0;3.0\n0,0,1,4.0;5.0;6.0\n",
    )?;
    let mask_path = dir.path().join("mask.csv");
    fs::write(&mask_path, "i,j,k,value\n0,0,0,true\n0,0,1,false\n")?;

    let volume = load_volume(&volume_path)?;
    assert_eq!(volume.data()[[0, 0, 1, 2]], 6.0);

    let mask = load_mask(&mask_path)?;
    assert_eq!(mask.voxel_coords(), vec![[0, 0, 0]]);
    Ok(())
}

#[test]
fn test_bad_csv_number_names_the_row() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("volume.csv");
    fs::write(&path, "i,j,k,signal\n0,0,0,1.0;abc\n")?;

    let err = load_volume(&path).unwrap_err();
    assert!(format!("{err:#}").contains("Row 0"));
    Ok(())
}

#[test]
fn test_volume_survives_every_format() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (volume, _) = generate_fake_fmri([6, 7, 8], 3, 11);
    let full = Mask3D::full(volume.shape3());

    for name in ["volume.json", "volume.csv", "volume.parquet"] {
        let path = dir.path().join(name);
        save_volume(&volume, Some(&full), &path)?;
        let loaded = load_volume(&path)?;
        assert_eq!(loaded, volume, "{name}");
    }
    Ok(())
}

#[test]
fn test_masked_parquet_volume_loads_as_mask() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (volume, mask) = generate_fake_fmri([8, 8, 8], 4, 12);
    let path = dir.path().join("masked.parquet");
    save_volume(&volume, Some(&mask), &path)?;

    let loaded = load_mask(&path)?;
    assert_eq!(loaded.voxel_coords(), mask.voxel_coords());
    Ok(())
}

#[test]
fn test_reduced_matrix_csv_round_trip() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (volume, mask) = generate_fake_fmri([10, 11, 12], 5, 13);
    let mut rena = ReNA::new(10).with_mask(Some(VolumeMasker::with_mask(mask)));
    let reduced = rena.fit_transform(&volume)?;

    let path = dir.path().join("reduced.csv");
    save_matrix(&reduced, "cluster", &path)?;
    let header = fs::read_to_string(&path)?;
    assert!(header.starts_with("cluster_0,cluster_1"));

    let loaded = load_matrix(&path)?;
    assert_eq!(loaded, reduced);

    let restored = rena.inverse_transform(&loaded)?;
    assert_eq!(restored.data().shape(), volume.data().shape());
    Ok(())
}

#[test]
fn test_missing_coordinate_column() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("volume.csv");
    fs::write(&path, "i,j,signal\n0,0,1.0\n")?;
    let err = load_volume(&path).unwrap_err();
    assert!(err.to_string().contains("'k'"));
    Ok(())
}

#[test]
fn test_parquet_error_row_counts_across_batches() -> anyhow::Result<()> {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    // More rows than one reader batch holds, with a null coordinate late in
    // the file.
    let n_rows = 3000;
    let bad_row = 2500;
    let i: Int64Array = (0..n_rows)
        .map(|r| if r == bad_row { None } else { Some(r as i64) })
        .collect();
    let zeros: Int64Array = (0..n_rows).map(|_| Some(0i64)).collect();

    let schema = Arc::new(Schema::new(vec![
        Field::new("i", DataType::Int64, true),
        Field::new("j", DataType::Int64, false),
        Field::new("k", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(i) as ArrayRef,
            Arc::new(zeros.clone()) as ArrayRef,
            Arc::new(zeros) as ArrayRef,
        ],
    )?;

    let dir = tempdir()?;
    let path = dir.path().join("mask.parquet");
    let mut writer = ArrowWriter::try_new(fs::File::create(&path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;

    let err = load_mask(&path).unwrap_err();
    assert!(format!("{err:#}").contains(&format!("Row {bad_row}")), "{err:#}");
    Ok(())
}
