//! # DICOM-SEG labelmap library
//!
//! This crate serves a high-level API for painting indexed segmentation
//! label volumes on top of a DICOM image series and for exchanging them as
//! DICOM Segmentation (SEG) objects.
//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components to read reference series and to read and write SEG objects.
//! A [`SegmentationSession`] owns every label volume of a viewer session:
//!  - one [`LabelSlice`] per reference frame, holding a segment number per
//!    pixel (0 is background)
//!  - a [`SegmentRegistry`] with the coded clinical identity of each segment
//!    (category, type and modifier), its algorithm and display color
//!  - shared RGBA lookup tables managed by a [`ColorLutManager`]
//!
//! Changes are reported to subscribers as typed [`SegmentationEvent`]s.
//! Encoding writes one 1-bit mask plane per frame and segment; decoding
//! merges the planes back into indexed slices. A labelmap holds one segment
//! per pixel, so overlapping segments collapse to the one written last and
//! the decoder reports it.
//!
//! Reference frames are resolved from DICOM files with a
//! [`ReferenceLoader`] or by the host through a [`ReferenceResolver`].
//! If the environment supports it, pixel scans run in parallel using rayon.
//!
//! # Examples
//!
//! ## Decoding a segmentation against its reference series
//!
//! Read the CT series from the dicom/ directory, load a SEG object painted
//! on it, then re-encode it for storage.
//!
//! ```no_run
//! # use dicom_seg_labelmap::{ReferenceLoader, SegmentationSession, SeriesOptions, SortBy};
//! let study = ReferenceLoader::load_from_directory("dicom", SortBy::InstanceNumber)
//!     .expect("should have loaded files from directory");
//! let series = study
//!     .image_series()
//!     .next()
//!     .expect("should have found an image series")
//!     .to_string();
//! let bytes = std::fs::read("seg.dcm").expect("should have read the segmentation");
//!
//! let mut session = SegmentationSession::default();
//! let loaded = session
//!     .load_segmentation(&bytes, study.frames(&series).expect("series should exist"))
//!     .expect("should have decoded the segmentation");
//! for warning in &loaded.warnings {
//!     println!("{}", warning.message());
//! }
//!
//! let request = session
//!     .prepare_persist(loaded.volume_index, &study.study, &SeriesOptions::default())
//!     .expect("should have encoded the volume");
//! std::fs::write("seg-out.dcm", &request.bytes).expect("should have written the file");
//! ```
//!
//! ## Painting a new volume
//!
//! ```
//! # use dicom_seg_labelmap::{ReferenceFrame, SegmentationSession};
//! let mut session = SegmentationSession::default();
//! let frames = (0..3)
//!     .map(|i| ReferenceFrame::new(format!("1.2.3.{i}"), 64, 64))
//!     .collect();
//! let volume = session.create_volume(frames).unwrap();
//! let liver = session.add_segment(volume).unwrap();
//! session.paint(volume, 1, [(10, 10), (10, 11)], liver).unwrap();
//! assert!(session.segments_present_on(volume, 1).unwrap().contains(&liver));
//! ```

pub mod catalog;
pub mod codec;
pub mod color;
pub mod color_lut;
pub mod config;
mod dataset;
pub mod enums;
pub mod notification;
pub mod reference_loader;
pub mod segment;
pub mod session;
pub mod study;
pub mod uid;
pub mod volume;

pub use catalog::{CodedConcept, CodingCatalog};
pub use codec::{DecodeWarning, SegDecoder, SegEncoder, SeriesOptions};
pub use color_lut::{ColorLut, ColorLutManager};
pub use config::SessionConfig;
pub use enums::{AlgorithmType, LoadState, SortBy};
pub use notification::{SegmentationEvent, SegmentationObserver, TracingObserver};
pub use reference_loader::{LoadedStudy, ReferenceFrame, ReferenceLoader, ReferenceResolver};
pub use segment::{Relabel, RelabelSelection, Segment, SegmentNumber, SegmentRegistry};
pub use session::{PersistRequest, SegmentationSession, SessionError};
pub use study::StudyContext;
pub use volume::{LabelSlice, LabelVolume, VolumeIndex};
