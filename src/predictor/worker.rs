use super::{DensityForecast, DensityPredictor, FeatureWindow};
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Request = (u64, FeatureWindow);
type Response = (u64, Result<DensityForecast>);

/// Runs a [DensityPredictor] on its own thread and bounds how long callers wait for it.
///
/// Each request carries a sequence number. Answers that arrive after their deadline are
/// discarded when the next request is made, so a slow model never delivers a stale
/// forecast. At most one request waits for the worker: a newer request replaces it.
pub struct PredictorWorker {
    requests: Option<Sender<Request>>,
    /// The worker's end of the request channel, used to withdraw a waiting request.
    pending: Receiver<Request>,
    responses: Receiver<Response>,
    handle: Option<JoinHandle<()>>,
    window_len: usize,
    deadline: Duration,
    seq: u64,
}

impl PredictorWorker {
    pub fn spawn(predictor: DensityPredictor, deadline: Duration) -> Self {
        let (req_tx, req_rx) = channel::bounded::<Request>(1);
        let pending = req_rx.clone();
        let (res_tx, res_rx) = channel::unbounded::<Response>();
        let window_len = predictor.window_len();
        let handle = std::thread::Builder::new()
            .name("density-predictor".to_string())
            .spawn(move || {
                for (seq, window) in req_rx {
                    if res_tx.send((seq, predictor.predict(&window))).is_err() {
                        break;
                    }
                }
                log::debug!("Predictor worker stopped");
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("Failed to start predictor worker: {}", err);
                None
            }
        };
        Self {
            requests: Some(req_tx),
            pending,
            responses: res_rx,
            handle,
            window_len,
            deadline,
            seq: 0,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Requests waiting for the worker to pick them up. Never more than one.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Requests a forecast and waits for it until the deadline expires.
    pub fn predict(&mut self, window: &FeatureWindow) -> Result<DensityForecast> {
        self.seq += 1;
        let seq = self.seq;
        let requests = self.requests.as_ref().ok_or(Error::WorkerDisconnected)?;
        let mut request = (seq, window.clone());
        loop {
            match requests.try_send(request) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    if let Ok((stale, _)) = self.pending.try_recv() {
                        log::debug!("Withdrawing unanswered request #{}", stale);
                    }
                    request = returned;
                }
                Err(TrySendError::Disconnected(_)) => return Err(Error::WorkerDisconnected),
            }
        }

        let expires = Instant::now() + self.deadline;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok((id, result)) if id == seq => return result,
                Ok((id, _)) => log::debug!("Discarding late forecast #{}", id),
                Err(RecvTimeoutError::Timeout) => return Err(Error::InferenceTimeout(self.deadline)),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::WorkerDisconnected),
            }
        }
    }
}

impl Drop for PredictorWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop once the current forecast is done.
        self.requests.take();
        for (stale, _) in self.pending.try_iter() {
            log::debug!("Withdrawing unanswered request #{}", stale);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Predictor worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for PredictorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorWorker")
            .field("window_len", &self.window_len)
            .field("deadline", &self.deadline)
            .field("seq", &self.seq)
            .field("backlog", &self.backlog())
            .finish()
    }
}

/// Where forecasts are computed.
#[derive(Debug)]
pub enum Inference {
    /// On the simulation thread.
    Inline(DensityPredictor),
    /// On a worker thread, with a deadline.
    Offloaded(PredictorWorker),
}

impl Inference {
    pub fn new(predictor: DensityPredictor, offload: bool, deadline: Duration) -> Self {
        if offload {
            Inference::Offloaded(PredictorWorker::spawn(predictor, deadline))
        } else {
            Inference::Inline(predictor)
        }
    }

    pub fn window_len(&self) -> usize {
        match self {
            Inference::Inline(predictor) => predictor.window_len(),
            Inference::Offloaded(worker) => worker.window_len(),
        }
    }

    pub fn predict(&mut self, window: &FeatureWindow) -> Result<DensityForecast> {
        match self {
            Inference::Inline(predictor) => predictor.predict(window),
            Inference::Offloaded(worker) => worker.predict(window),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PredictorConfig;
    use crate::predictor::test::window;
    use crate::predictor::{Forecaster, PersistenceModel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Sleeps on selected calls.
    struct Sluggish {
        calls: Arc<AtomicUsize>,
        slow_call: usize,
    }

    impl Forecaster for Sluggish {
        fn window_len(&self) -> usize {
            4
        }

        fn forecast(&self, window: &FeatureWindow) -> f64 {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.slow_call {
                std::thread::sleep(Duration::from_millis(300));
            }
            window.latest()
        }
    }

    fn predictor(model: Box<dyn Forecaster>) -> DensityPredictor {
        let mut predictor = DensityPredictor::new(&PredictorConfig::default(), 100.0);
        predictor.load(model).unwrap();
        predictor
    }

    #[test]
    fn offloaded_forecast() {
        let mut inference = Inference::new(
            predictor(Box::new(PersistenceModel { window: 4 })),
            true,
            Duration::from_secs(5),
        );
        assert_eq!(inference.window_len(), 4);
        let forecast = inference.predict(&window(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(forecast.predicted_density, 4.0);
    }

    #[test]
    fn errors_cross_the_thread() {
        let mut worker = PredictorWorker::spawn(
            DensityPredictor::new(&PredictorConfig::default(), 100.0),
            Duration::from_secs(5),
        );
        let err = worker.predict(&window(&[1.0, 2.0, 3.0, 4.0])).unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable));
    }

    #[test]
    fn late_answers_are_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = Sluggish {
            calls: calls.clone(),
            slow_call: 0,
        };
        let mut worker = PredictorWorker::spawn(predictor(Box::new(model)), Duration::from_millis(50));

        let err = worker.predict(&window(&[1.0, 2.0, 3.0, 10.0])).unwrap_err();
        assert!(matches!(err, Error::InferenceTimeout(_)));

        worker.deadline = Duration::from_secs(5);
        let forecast = worker.predict(&window(&[1.0, 2.0, 3.0, 20.0])).unwrap();
        assert_eq!(forecast.predicted_density, 20.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Always slower than the deadlines used below.
    struct Slow;

    impl Forecaster for Slow {
        fn window_len(&self) -> usize {
            4
        }

        fn forecast(&self, window: &FeatureWindow) -> f64 {
            std::thread::sleep(Duration::from_millis(40));
            window.latest()
        }
    }

    #[test]
    fn backlog_stays_bounded() {
        let mut worker = PredictorWorker::spawn(predictor(Box::new(Slow)), Duration::from_millis(10));
        for i in 0..40 {
            let err = worker.predict(&window(&[1.0, 2.0, 3.0, i as f64])).unwrap_err();
            assert!(matches!(err, Error::InferenceTimeout(_)));
            assert!(worker.backlog() <= 1, "backlog {} after {} requests", worker.backlog(), i + 1);
        }
    }

    #[test]
    fn recovers_after_a_slow_spell() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = Sluggish {
            calls: calls.clone(),
            slow_call: 0,
        };
        let mut worker = PredictorWorker::spawn(predictor(Box::new(model)), Duration::from_millis(10));
        for i in 0..10 {
            let _ = worker.predict(&window(&[1.0, 2.0, 3.0, i as f64]));
        }

        worker.deadline = Duration::from_secs(5);
        let forecast = worker.predict(&window(&[1.0, 2.0, 3.0, 42.0])).unwrap();
        assert_eq!(forecast.predicted_density, 42.0);
        assert!(calls.load(Ordering::SeqCst) < 11);
    }
}
