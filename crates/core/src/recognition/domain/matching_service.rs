use std::sync::Arc;

use thiserror::Error;

use super::identity_gallery::EnrolledFace;
use crate::engine::domain::engine_error::EngineError;
use crate::engine::domain::engine_handle::EngineHandle;
use crate::engine::domain::face_engine::{FaceFeature, FeatureEngine};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("no identities enrolled")]
    EmptyGallery,
    #[error("compare failed: {0}")]
    Engine(#[from] EngineError),
    #[error("every compare against the {attempted} enrolled identities failed, last: {last}")]
    NoComparableEnrollment { attempted: usize, last: EngineError },
}

/// Best match of a 1:N search.
#[derive(Clone, Debug, PartialEq)]
pub struct CompareResult {
    pub index: usize,
    pub identity: EnrolledFace,
    pub similarity: f32,
}

/// Compares features through the feature sub-handle.
pub struct MatchingService {
    engine: Arc<EngineHandle<dyn FeatureEngine>>,
}

impl MatchingService {
    pub fn new(engine: Arc<EngineHandle<dyn FeatureEngine>>) -> Self {
        Self { engine }
    }

    /// 1:N search. Compares that fail are logged and skipped; ties keep the
    /// earliest enrollment.
    pub fn search(
        &self,
        query: &FaceFeature,
        enrolled: &[EnrolledFace],
    ) -> Result<CompareResult, MatchError> {
        if enrolled.is_empty() {
            return Err(MatchError::EmptyGallery);
        }

        let mut best: Option<(usize, f32)> = None;
        let mut last_error = None;
        for (index, candidate) in enrolled.iter().enumerate() {
            match self.engine.call(|e| e.compare(query, &candidate.feature)) {
                Ok(similarity) => {
                    if best.map_or(true, |(_, s)| similarity > s) {
                        best = Some((index, similarity));
                    }
                }
                Err(err) => {
                    log::error!("compare against identity {} failed: {err}", candidate.id);
                    last_error = Some(err);
                }
            }
        }

        let Some((index, similarity)) = best else {
            return Err(match last_error {
                Some(last) => MatchError::NoComparableEnrollment {
                    attempted: enrolled.len(),
                    last,
                },
                None => MatchError::EmptyGallery,
            });
        };
        Ok(CompareResult {
            index,
            identity: enrolled[index].clone(),
            similarity,
        })
    }

    /// 1:1 comparison.
    pub fn compare_one(&self, a: &FaceFeature, b: &FaceFeature) -> Result<f32, MatchError> {
        Ok(self.engine.call(|e| e.compare(a, b))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::domain::engine_error::EngineResult;
    use crate::engine::domain::face_engine::{DetectedFace, ExtractPurpose, MaskState};
    use crate::shared::config::Orientation;
    use crate::shared::frame::Frame;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    /// Scores each enrolled feature by its first byte; byte 0 fails.
    struct ByteScorer {
        compares: Arc<Mutex<usize>>,
    }

    impl FeatureEngine for ByteScorer {
        fn set_orientation(&mut self, _: Orientation) -> EngineResult<()> {
            Ok(())
        }

        fn image_quality(&mut self, _: &Frame, _: &DetectedFace, _: MaskState) -> EngineResult<f32> {
            Ok(1.0)
        }

        fn extract_feature(
            &mut self,
            _: &Frame,
            _: &DetectedFace,
            _: MaskState,
            _: ExtractPurpose,
        ) -> EngineResult<FaceFeature> {
            Ok(FaceFeature(vec![]))
        }

        fn compare(&mut self, _a: &FaceFeature, b: &FaceFeature) -> EngineResult<f32> {
            *self.compares.lock().unwrap() += 1;
            match b.as_bytes()[0] {
                0 => Err(EngineError::new(1)),
                v => Ok(v as f32 / 100.0),
            }
        }
    }

    fn service() -> (MatchingService, Arc<Mutex<usize>>) {
        let compares = Arc::new(Mutex::new(0));
        let engine: Box<dyn FeatureEngine> = Box::new(ByteScorer {
            compares: compares.clone(),
        });
        (
            MatchingService::new(Arc::new(EngineHandle::new("feature", engine))),
            compares,
        )
    }

    fn gallery(scores: &[u8]) -> Vec<EnrolledFace> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| EnrolledFace {
                id: i as u64,
                name: format!("person-{i}"),
                feature: FaceFeature(vec![s]),
            })
            .collect()
    }

    #[test]
    fn test_empty_gallery_fails_without_compare() {
        let (service, compares) = service();
        let err = service.search(&FaceFeature(vec![1]), &[]).unwrap_err();
        assert_eq!(err, MatchError::EmptyGallery);
        assert_eq!(*compares.lock().unwrap(), 0);
    }

    #[test]
    fn test_picks_highest_similarity() {
        let (service, compares) = service();
        let result = service.search(&FaceFeature(vec![1]), &gallery(&[40, 55, 90])).unwrap();
        assert_eq!(result.index, 2);
        assert_eq!(result.identity.name, "person-2");
        assert_relative_eq!(result.similarity, 0.9);
        assert_eq!(*compares.lock().unwrap(), 3);
    }

    #[test]
    fn test_tie_keeps_earliest() {
        let (service, _) = service();
        let result = service.search(&FaceFeature(vec![1]), &gallery(&[70, 70, 10])).unwrap();
        assert_eq!(result.index, 0);
    }

    #[test]
    fn test_failed_compares_are_skipped() {
        let (service, _) = service();
        let result = service.search(&FaceFeature(vec![1]), &gallery(&[0, 30, 0])).unwrap();
        assert_eq!(result.index, 1);
    }

    #[test]
    fn test_all_compares_failing_is_distinct_error() {
        let (service, _) = service();
        let err = service.search(&FaceFeature(vec![1]), &gallery(&[0, 0])).unwrap_err();
        assert_eq!(
            err,
            MatchError::NoComparableEnrollment {
                attempted: 2,
                last: EngineError::new(1)
            }
        );
    }

    #[test]
    fn test_compare_one() {
        let (service, _) = service();
        assert_relative_eq!(
            service.compare_one(&FaceFeature(vec![1]), &FaceFeature(vec![25])).unwrap(),
            0.25
        );
        let err = service.compare_one(&FaceFeature(vec![1]), &FaceFeature(vec![0])).unwrap_err();
        assert_eq!(err, MatchError::Engine(EngineError::new(1)));
    }
}
