/// A series already stored in the study, as far as numbering is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudySeries {
    pub series_instance_uid: String,
    pub modality: String,
    pub series_number: Option<i32>,
}

/// What the encoder needs to know about the study a segmentation joins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyContext {
    pub study_instance_uid: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    pub series: Vec<StudySeries>,
}

impl StudyContext {
    pub fn new(study_instance_uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            ..Self::default()
        }
    }

    pub fn with_series(mut self, series: StudySeries) -> Self {
        self.series.push(series);
        self
    }

    pub fn segmentation_series_count(&self) -> usize {
        self.series
            .iter()
            .filter(|s| s.modality.eq_ignore_ascii_case("SEG"))
            .count()
    }

    pub fn max_series_number(&self) -> Option<i32> {
        self.series.iter().filter_map(|s| s.series_number).max()
    }

    /// `"Segmentation #n"` where n counts the SEG series already stored.
    pub fn next_segmentation_description(&self) -> String {
        format!("Segmentation #{}", self.segmentation_series_count() + 1)
    }

    /// One past the highest series number in the study, or 1.
    pub fn next_series_number(&self) -> i32 {
        self.max_series_number().map_or(1, |n| n + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(uid: &str, modality: &str, number: Option<i32>) -> StudySeries {
        StudySeries {
            series_instance_uid: uid.to_string(),
            modality: modality.to_string(),
            series_number: number,
        }
    }

    #[test]
    fn series_number_follows_the_highest() {
        let study = StudyContext::new("1.2.3")
            .with_series(series("a", "CT", Some(1)))
            .with_series(series("b", "CT", Some(2)))
            .with_series(series("c", "SEG", Some(4)));
        assert_eq!(study.next_series_number(), 5);
        assert_eq!(study.next_segmentation_description(), "Segmentation #2");
    }

    #[test]
    fn empty_study_starts_at_one() {
        let study = StudyContext::new("1.2.3").with_series(series("a", "CT", None));
        assert_eq!(study.next_series_number(), 1);
        assert_eq!(study.next_segmentation_description(), "Segmentation #1");
    }
}
