use rollcall_core::error::{ErrorKind, Failure};
use rollcall_core::extractor::{self, DetectedFace, ExtractError, FeatureExtractor, SampleBatch};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cannot load extractor: {0}")]
    Load(#[from] ExtractError),
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Extract(Failure),
    #[error("extraction workers exited")]
    ChannelClosed,
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Extract(failure) => failure,
            EngineError::Load(e) => e.into(),
            other => Failure::new(ErrorKind::Unavailable, other.to_string()),
        }
    }
}

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    /// Find and fingerprint every face in one image.
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, Failure>>,
    },
    /// One enrollment fingerprint per sample image.
    Samples {
        images: Arc<Vec<Vec<u8>>>,
        reply: oneshot::Sender<SampleBatch>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Detect faces in an encoded image and fingerprint each of them.
    pub async fn detect_faces(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx
            .await
            .map_err(|_| EngineError::ChannelClosed)?
            .map_err(EngineError::Extract)
    }

    /// Extract enrollment samples, dropping (and reporting) unusable images.
    pub async fn extract_samples(&self, images: Arc<Vec<Vec<u8>>>) -> Result<SampleBatch, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Samples {
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn `workers` extraction threads sharing one bounded request queue.
///
/// Every worker owns its own extractor built by `load`. All extractors are
/// created before any thread starts, so a missing model fails startup
/// instead of the first request.
pub fn spawn_engine<E, F>(workers: usize, queue_depth: usize, mut load: F) -> Result<EngineHandle, EngineError>
where
    E: FeatureExtractor + 'static,
    F: FnMut() -> Result<E, ExtractError>,
{
    let workers = workers.max(1);
    let extractors = (0..workers).map(|_| load()).collect::<Result<Vec<E>, _>>()?;
    tracing::info!(workers, queue_depth, "extractors loaded");

    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for (id, extractor) in extractors.into_iter().enumerate() {
        let rx = rx.clone();
        std::thread::Builder::new()
            .name(format!("rollcall-worker-{id}"))
            .spawn(move || run_worker(id, extractor, rx))?;
    }

    Ok(EngineHandle { tx, workers })
}

fn run_worker<E: FeatureExtractor>(id: usize, mut extractor: E, rx: Arc<Mutex<mpsc::Receiver<EngineRequest>>>) {
    tracing::debug!(worker = id, "worker started");
    loop {
        // Only the receive holds the lock; extraction runs unlocked.
        let request = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
        let Some(request) = request else {
            break;
        };
        match request {
            EngineRequest::Detect { image, reply } => {
                let result = extractor::detect_faces(&mut extractor, &image).map_err(Failure::from);
                let _ = reply.send(result);
            }
            EngineRequest::Samples { images, reply } => {
                let batch = extractor::collect_samples(&mut extractor, &images);
                let _ = reply.send(batch);
            }
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use rollcall_core::types::{BoundingBox, Fingerprint};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// One face per image; its fingerprint is the top-left pixel. Tracks
    /// how many extractions run at the same time.
    struct SlowExtractor {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FeatureExtractor for SlowExtractor {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.9,
            }])
        }

        fn extract(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<Fingerprint, ExtractError> {
            let p = image.get_pixel(0, 0);
            Ok(Fingerprint::new(p.0.iter().map(|&c| c as f32).collect()))
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb(color)))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn engine(workers: usize) -> (EngineHandle, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handle = spawn_engine(workers, 2, || {
            Ok(SlowExtractor {
                active: active.clone(),
                peak: peak.clone(),
            })
        })
        .unwrap();
        (handle, peak)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let (handle, peak) = engine(2);
        let tasks: Vec<_> = (0..12u8)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.detect_faces(png([i + 1, 0, 0])).await })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let faces = task.await.unwrap().unwrap();
            assert_eq!(faces.len(), 1);
            assert_eq!(
                faces[0].fingerprint.as_ref().unwrap().values,
                vec![(i + 1) as f32, 0.0, 0.0]
            );
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_decode_failure_reaches_caller() {
        let (handle, _) = engine(1);
        let err = handle.detect_faces(b"garbage".to_vec()).await.unwrap_err();
        assert_eq!(Failure::from(err).kind, ErrorKind::DecodeFailure);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_extract_samples_keeps_order() {
        let (handle, _) = engine(2);
        let images = Arc::new(vec![png([1, 1, 1]), b"bad".to_vec(), png([3, 3, 3])]);
        let batch = handle.extract_samples(images).await.unwrap();

        assert_eq!(batch.fingerprints.len(), 2);
        assert_eq!(batch.fingerprints[1].values, vec![3.0, 3.0, 3.0]);
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(batch.warnings[0].index, 1);
    }

    #[test]
    fn test_load_failure_fails_startup() {
        let result = spawn_engine::<SlowExtractor, _>(2, 4, || Err(ExtractError::NoFace));
        assert!(matches!(result, Err(EngineError::Load(_))));
    }

    #[test]
    fn test_closed_pool_is_unavailable() {
        let failure = Failure::from(EngineError::ChannelClosed);
        assert_eq!(failure.kind, ErrorKind::Unavailable);
    }
}
