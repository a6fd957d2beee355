use dicom_dictionary_std::tags;
use dicom_seg_labelmap::{
    CodedConcept, Relabel, SegmentationSession, SeriesOptions, StudyContext,
    codec::SegDecoder,
    color::{dicom_lab_to_rgba, rgba_to_dicom_lab},
    reference_loader::ReferenceFrame,
    study::StudySeries,
};
use image::Rgba;

fn frames() -> Vec<ReferenceFrame> {
    (0..4)
        .map(|i| ReferenceFrame {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            ..ReferenceFrame::new(format!("1.2.826.0.1.3680043.2.{i}"), 5, 3)
        })
        .collect()
}

fn study() -> StudyContext {
    StudyContext::new("1.2.826.0.1.3680043.2.100").with_series(StudySeries {
        series_instance_uid: "1.2.826.0.1.3680043.2.101".to_string(),
        modality: "CT".to_string(),
        series_number: Some(3),
    })
}

fn painted_session() -> (SegmentationSession, usize) {
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames()).unwrap();

    let liver = session.add_segment(volume).unwrap();
    session
        .relabel_segment(
            volume,
            liver,
            Relabel {
                category: Some(CodedConcept::new("123037004", "SCT", "Anatomical Structure")),
                property_type: Some(CodedConcept::new("10200004", "SCT", "Liver")),
                modifier: None,
                label: Some("Liver".to_string()),
            },
        )
        .unwrap();
    session.paint(volume, 1, [(0, 0), (4, 2)], liver).unwrap();
    session.paint(volume, 2, [(2, 1)], liver).unwrap();

    let lesion = session.add_segment(volume).unwrap();
    session
        .set_segment_color(volume, lesion, Rgba([30, 144, 255, 255]))
        .unwrap();
    session.paint(volume, 2, [(3, 0), (3, 1)], lesion).unwrap();
    (session, volume)
}

#[test]
fn bytes_round_trip_keeps_segments_labels_and_colors() {
    let (session, volume) = painted_session();
    let bytes = session
        .encode_to_bytes(volume, &study(), &SeriesOptions::default())
        .unwrap();
    assert_eq!(&bytes[128..132], b"DICM");

    let mut reader = SegmentationSession::default();
    let loaded = reader.load_segmentation(&bytes, frames()).unwrap();
    assert!(loaded.warnings.is_empty(), "{:?}", loaded.warnings);

    let original = session.volume(volume).unwrap();
    let decoded = reader.volume(loaded.volume_index).unwrap();
    assert!(decoded.is_loaded());
    assert_eq!(
        decoded.registry().numbers().collect::<Vec<_>>(),
        original.registry().numbers().collect::<Vec<_>>()
    );
    for segment in original.registry().iter() {
        let copy = decoded.registry().get(segment.number).unwrap();
        assert_eq!(copy.label, segment.label);
        assert_eq!(copy.property_type, segment.property_type);

        let color = session.segment_color(volume, segment.number).unwrap();
        let decoded_color = reader
            .segment_color(loaded.volume_index, segment.number)
            .unwrap();
        for channel in 0..3 {
            let delta = i16::from(color.0[channel]) - i16::from(decoded_color.0[channel]);
            assert!(delta.abs() <= 1, "{color:?} vs {decoded_color:?}");
        }
    }

    for frame in 0..4 {
        assert_eq!(
            decoded.segments_present_on(frame),
            original.segments_present_on(frame)
        );
    }
    assert_eq!(decoded.export_raw_labelmap(), original.export_raw_labelmap());
}

#[test]
fn decoded_volumes_overwrite_their_stored_object() {
    let (mut session, volume) = painted_session();
    let first = session
        .prepare_persist(volume, &study(), &SeriesOptions::default())
        .unwrap();
    assert!(!first.overwrite);
    assert_eq!(first.study_id, "1.2.826.0.1.3680043.2.100");

    session
        .record_persisted(volume, first.sop_instance_uid.clone(), first.series_instance_uid.clone())
        .unwrap();
    let second = session
        .prepare_persist(volume, &study(), &SeriesOptions::default())
        .unwrap();
    assert!(second.overwrite);
    assert_eq!(second.sop_instance_uid, first.sop_instance_uid);

    let mut reader = SegmentationSession::default();
    let loaded = reader.load_segmentation(&second.bytes, frames()).unwrap();
    let metadata = &reader.volume(loaded.volume_index).unwrap().series_metadata;
    assert_eq!(metadata.sop_instance_uid.as_deref(), Some(first.sop_instance_uid.as_str()));
    assert_eq!(metadata.series_number, Some(4));
    assert_eq!(metadata.description.as_deref(), Some("Segmentation #1"));
    assert_eq!(metadata.comment.as_deref(), Some("RESEARCH"));
}

#[test]
fn encoded_header_describes_a_binary_segmentation() {
    let (session, volume) = painted_session();
    let encoded = session
        .encode(volume, &study(), &SeriesOptions::default())
        .unwrap();
    let dataset = &encoded.dataset;
    let text = |tag| dataset.element(tag).unwrap().to_str().unwrap().trim().to_string();
    let int = |tag| dataset.element(tag).unwrap().to_int::<i32>().unwrap();

    assert_eq!(text(tags::SEGMENTATION_TYPE), "BINARY");
    assert_eq!(int(tags::BITS_ALLOCATED), 1);
    assert_eq!(int(tags::ROWS), 5);
    assert_eq!(int(tags::COLUMNS), 3);
    // frame 1: liver, frame 2: liver and lesion
    assert_eq!(int(tags::NUMBER_OF_FRAMES), 3);
    assert_eq!(encoded.frame_count, 3);
    let pixel_data = dataset.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
    assert_eq!(pixel_data.len(), 6);
}

#[test]
fn stored_colors_survive_cielab_conversion() {
    for rgba in [Rgba([221, 85, 85, 255]), Rgba([30, 144, 255, 255]), Rgba([0, 0, 0, 255])] {
        let back = dicom_lab_to_rgba(rgba_to_dicom_lab(rgba));
        for channel in 0..3 {
            assert!((i16::from(rgba.0[channel]) - i16::from(back.0[channel])).abs() <= 1);
        }
    }
}

#[test]
fn decoding_against_the_wrong_frames_fails() {
    let (session, volume) = painted_session();
    let bytes = session
        .encode_to_bytes(volume, &study(), &SeriesOptions::default())
        .unwrap();
    let catalog = session.catalog().clone();
    let wrong_size: Vec<ReferenceFrame> = frames()
        .into_iter()
        .map(|f| ReferenceFrame { rows: 4, ..f })
        .collect();
    assert!(
        SegDecoder::decode_bytes(&bytes, wrong_size, &catalog, session.config().palette).is_err()
    );

    let mut reader = SegmentationSession::default();
    let unknown: Vec<ReferenceFrame> = (0..4)
        .map(|i| ReferenceFrame::new(format!("9.9.{i}"), 5, 3))
        .collect();
    assert!(reader.load_segmentation(&bytes, unknown).is_err());
    assert!(reader.volume(0).unwrap().load_error());
}

#[test]
fn segments_without_pixels_survive_a_round_trip() {
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames()).unwrap();
    let number = session.add_segment(volume).unwrap();
    let bytes = session
        .encode_to_bytes(volume, &study(), &SeriesOptions::default())
        .unwrap();

    let mut reader = SegmentationSession::default();
    let loaded = reader.load_segmentation(&bytes, frames()).unwrap();
    let decoded = reader.volume(loaded.volume_index).unwrap();
    assert!(decoded.is_loaded());
    assert_eq!(decoded.registry().numbers().collect::<Vec<_>>(), vec![number]);
    assert!(decoded.segment_listing().contains(&number));
    assert!(decoded.referenced_segments().contains(&number));
}
