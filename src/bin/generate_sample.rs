use std::path::Path;

use anyhow::Result;

use rusty_rena::data::loader::save_volume;
use rusty_rena::data::synthetic::generate_smooth_fmri;
use rusty_rena::Mask3D;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let shape = [20, 22, 24];
    let length = 40;
    let (volume, mask) = generate_smooth_fmri(shape, length, 6, 5.0, 42)?;

    let output_path = Path::new("sample_volume.parquet");
    // Write the background too so the grid shape survives the round trip.
    save_volume(&volume, Some(&Mask3D::full(shape)), output_path)?;

    println!(
        "Wrote grid {2:?} ({0} masked voxels, {1} samples each) to {3}",
        mask.count(),
        length,
        shape,
        output_path.display()
    );
    Ok(())
}
