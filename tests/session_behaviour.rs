use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use dicom_seg_labelmap::{
    LoadState, Relabel, SegmentationEvent, SegmentationSession, StudyContext,
    reference_loader::{LoadedStudy, ReferenceFrame, ReferenceLoadError, ReferenceResolver},
    session::SessionError,
    study::StudySeries,
};
use futures::{
    FutureExt,
    future::{self, LocalBoxFuture},
};

fn frames(count: usize) -> Vec<ReferenceFrame> {
    (0..count)
        .map(|i| ReferenceFrame::new(format!("1.3.6.1.4.1.5962.1.{i}"), 8, 8))
        .collect()
}

fn loaded_study() -> LoadedStudy {
    LoadedStudy {
        study: StudyContext::new("1.3.6.1.4.1.5962.1"),
        frames_by_series: BTreeMap::from([("1.3.6.1.4.1.5962.2".to_string(), frames(6))]),
    }
}

/// Stands in for a host whose fetch never completes.
struct StalledResolver;

impl ReferenceResolver for StalledResolver {
    fn resolve_frames<'a>(
        &'a self,
        _series_id: &'a str,
    ) -> LocalBoxFuture<'a, Result<Vec<ReferenceFrame>, ReferenceLoadError>> {
        future::pending().boxed_local()
    }
}

#[test]
fn add_segment_numbers_follow_the_segment_count() {
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames(3)).unwrap();
    for k in 0..4u16 {
        let number = session.add_segment(volume).unwrap();
        assert_eq!(number, k + 1);
        let listed = session
            .volume(volume)
            .unwrap()
            .slices()
            .iter()
            .flatten()
            .any(|slice| slice.lists(number));
        assert!(listed);
    }
}

#[test]
fn background_is_never_a_registry_key() {
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames(2)).unwrap();
    session.add_segment(volume).unwrap();
    session.paint(volume, 0, [(1, 1)], 0).unwrap();
    session.paint(volume, 1, [(2, 2)], 6).unwrap();
    session.erase(volume, 1, [(2, 2)]).unwrap();
    assert!(matches!(
        session.relabel_segment(volume, 0, Default::default()),
        Err(SessionError::ReservedSegment)
    ));
    assert!(!session.volume(volume).unwrap().registry().contains(0));
}

#[test]
fn closest_slice_picks_the_frame_nearest_the_mean() {
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames(10)).unwrap();
    for frame in [2, 4, 9] {
        session.paint(volume, frame, [(0, 0)], 3).unwrap();
    }
    assert_eq!(session.closest_slice(volume, 3).unwrap(), Some(4));
}

#[test]
fn study_numbering_continues_after_existing_series() {
    let study = [1, 2, 4]
        .into_iter()
        .fold(StudyContext::new("1.2.3"), |study, number| {
            study.with_series(StudySeries {
                series_instance_uid: format!("1.2.3.{number}"),
                modality: "MR".to_string(),
                series_number: Some(number),
            })
        });
    let mut session = SegmentationSession::default();
    let volume = session.create_volume(frames(1)).unwrap();
    session.paint(volume, 0, [(0, 0)], 1).unwrap();
    let encoded = session.encode(volume, &study, &Default::default()).unwrap();
    assert_eq!(encoded.series_number, 5);

    let second = session.create_volume_in_study(frames(1), &study).unwrap();
    let metadata = &session.volume(second).unwrap().series_metadata;
    assert_eq!(metadata.series_number, Some(5));
    assert_eq!(metadata.description.as_deref(), Some("Segmentation #2"));
}

#[test]
fn events_follow_each_mutation() {
    let mut session = SegmentationSession::default();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    session.subscribe(move |event: &SegmentationEvent| sink.borrow_mut().push(event.clone()));

    let volume = session.create_volume(frames(2)).unwrap();
    let number = session.add_segment(volume).unwrap();
    session.paint(volume, 1, [(0, 0)], number).unwrap();
    session.toggle_visibility(volume, number).unwrap();
    let relabel = Relabel {
        label: Some("Liver".to_string()),
        ..Relabel::default()
    };
    session.relabel_segment(volume, number, relabel).unwrap();
    session.delete_volume(volume).unwrap();

    assert_eq!(
        *events.borrow(),
        vec![
            SegmentationEvent::VolumeCreated { index: 0 },
            SegmentationEvent::ActiveVolumeChanged {
                previous: None,
                current: Some(0)
            },
            SegmentationEvent::SegmentAdded {
                volume_index: 0,
                number: 1
            },
            SegmentationEvent::ActiveSegmentChanged {
                volume_index: 0,
                previous: 0,
                current: 1
            },
            SegmentationEvent::LabelmapMutated { volume_index: 0 },
            SegmentationEvent::SegmentVisibilityChanged {
                volume_index: 0,
                number: 1,
                visible: false
            },
            SegmentationEvent::SegmentRelabeled {
                volume_index: 0,
                number: 1,
                label: "Liver".to_string()
            },
            SegmentationEvent::VolumeDeleted { index: 0 },
            SegmentationEvent::ActiveVolumeChanged {
                previous: Some(0),
                current: None
            },
        ]
    );
}

#[tokio::test]
async fn volumes_can_be_created_from_a_resolved_series() {
    let study = loaded_study();
    let mut session = SegmentationSession::default();
    let index = session
        .create_volume_from_series(&study, "1.3.6.1.4.1.5962.2")
        .await
        .unwrap();
    let volume = session.volume(index).unwrap();
    assert_eq!(volume.load_state(), LoadState::Loaded);
    assert_eq!(volume.reference_frame_count(), 6);
}

#[tokio::test]
async fn unknown_series_leave_a_failed_volume() {
    let study = loaded_study();
    let mut session = SegmentationSession::default();
    let result = session.create_volume_from_series(&study, "2.25.1").await;
    assert!(matches!(
        result,
        Err(SessionError::ReferenceLoad(ReferenceLoadError::UnknownSeries(_)))
    ));
    assert!(session.volume(0).unwrap().load_error());
    assert_eq!(session.active_volume(), None);
}

#[test]
fn cancelled_loads_are_marked_failed() {
    let mut session = SegmentationSession::default();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    session.subscribe(move |event: &SegmentationEvent| sink.borrow_mut().push(event.clone()));

    let pending = session
        .load_segmentation_from_series(&StalledResolver, "1.2.3", &[])
        .now_or_never();
    assert!(pending.is_none());

    let volume = session.volume(0).unwrap();
    assert!(volume.load_error());
    assert!(matches!(
        events.borrow().as_slice(),
        [SegmentationEvent::SegmentationLoadFailed { volume_index: 0, .. }]
    ));

    // the failed slot is kept until the host deletes it
    assert_eq!(session.next_volume_index(), 1);
    session.delete_volume(0).unwrap();
    assert_eq!(session.next_volume_index(), 0);
}
