use std::{env, fs, path::PathBuf};

use dicom_seg_labelmap::{
    SegmentationSession, SeriesOptions, TracingObserver, enums::SortBy,
    reference_loader::ReferenceLoader,
};
use tracing::info;
use tracing_subscriber::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let reference_dir = PathBuf::from(args.next().unwrap_or_else(|| "dicom".to_string()));
    let seg_path = PathBuf::from(args.next().unwrap_or_else(|| "seg.dcm".to_string()));
    let output_path = PathBuf::from(args.next().unwrap_or_else(|| "result.dcm".to_string()));

    let study = ReferenceLoader::load_from_directory(&reference_dir, SortBy::InstanceNumber)
        .expect("should have loaded files from directory");
    let series_id = study
        .image_series()
        .next()
        .expect("should have found an image series")
        .to_string();
    let bytes = fs::read(&seg_path).expect("should have read the segmentation file");

    let mut session = SegmentationSession::default();
    session.subscribe(TracingObserver);
    let loaded = session
        .load_segmentation_from_series(&study, &series_id, &bytes)
        .await
        .expect("should have decoded the segmentation");
    for warning in &loaded.warnings {
        info!(warning = %warning.message(), "decode warning");
    }

    let volume = session
        .volume(loaded.volume_index)
        .expect("decoded volume should exist");
    for segment in volume.registry().iter() {
        info!(
            number = segment.number,
            label = %segment.label,
            description = %segment.description(),
            closest_slice = ?volume.closest_slice(segment.number),
            "segment"
        );
    }

    let request = session
        .prepare_persist(loaded.volume_index, &study.study, &SeriesOptions::default())
        .expect("should have encoded the volume");
    fs::write(&output_path, &request.bytes).expect("should have written the output file");
    info!(
        path = %output_path.display(),
        overwrite = request.overwrite,
        sop_instance_uid = %request.sop_instance_uid,
        "wrote segmentation"
    );
}
