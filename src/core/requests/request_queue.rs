// Serializing request queue.
//
// Every edit notification is turned into a job on a bounded channel, and a single
// worker task drains that channel one job at a time. With one worker there is
// never more than one render in flight against the template, so no lock is
// needed around it. When the channel is full the configured backpressure policy
// decides between failing fast and waiting a bounded time for a slot.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::request_models::{EditEvent, RowOutcome};
use super::request_service::ProcessError;

/// Anything that can process a row; implemented by `RowProcessor`.
#[async_trait]
pub trait RowHandler: Send + Sync + 'static {
    async fn handle_row(&self, row: u32) -> Result<RowOutcome, ProcessError>;
}

/// What to do when the queue has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Reject,
    Wait(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 32,
            backpressure: Backpressure::Wait(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Request queue is full")]
    Full,

    #[error("No queue slot freed up within {0:?}")]
    TimedOut(Duration),

    #[error("Request queue is closed")]
    Closed,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

struct Job {
    row: u32,
    reply: Option<oneshot::Sender<Result<RowOutcome, ProcessError>>>,
}

/// Cloneable handle for submitting rows to the worker.
#[derive(Clone)]
pub struct RequestQueue {
    sender: mpsc::Sender<Job>,
    data_sheet: Arc<str>,
    backpressure: Backpressure,
}

impl RequestQueue {
    /// Spawns the worker. The worker stops once every handle has been dropped
    /// and the remaining jobs are drained.
    pub fn start<H: RowHandler>(
        handler: Arc<H>,
        data_sheet: impl Into<String>,
        settings: QueueSettings,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
        let worker = tokio::spawn(run_worker(handler, receiver));

        let queue = Self {
            sender,
            data_sheet: Arc::from(data_sheet.into()),
            backpressure: settings.backpressure,
        };
        (queue, worker)
    }

    /// Queues the event's row without waiting for it to be processed.
    /// Returns `false` when the event does not target a data row.
    pub async fn dispatch(&self, event: &EditEvent) -> Result<bool, QueueError> {
        if !event.targets(&self.data_sheet) {
            debug!(sheet = %event.sheet_name, row = event.row, "Ignoring edit");
            return Ok(false);
        }

        self.enqueue(Job {
            row: event.row,
            reply: None,
        })
        .await?;
        Ok(true)
    }

    /// Queues the event's row and waits for the outcome.
    pub async fn process(&self, event: &EditEvent) -> Result<RowOutcome, QueueError> {
        if !event.targets(&self.data_sheet) {
            return Ok(RowOutcome::Ignored);
        }

        let (reply, outcome) = oneshot::channel();
        self.enqueue(Job {
            row: event.row,
            reply: Some(reply),
        })
        .await?;

        Ok(outcome.await.map_err(|_| QueueError::Closed)??)
    }

    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        match self.backpressure {
            Backpressure::Reject => self.sender.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }),
            Backpressure::Wait(bound) => {
                self.sender
                    .send_timeout(job, bound)
                    .await
                    .map_err(|err| match err {
                        mpsc::error::SendTimeoutError::Timeout(_) => QueueError::TimedOut(bound),
                        mpsc::error::SendTimeoutError::Closed(_) => QueueError::Closed,
                    })
            }
        }
    }
}

async fn run_worker<H: RowHandler>(handler: Arc<H>, mut jobs: mpsc::Receiver<Job>) {
    info!("Request worker started");

    while let Some(job) = jobs.recv().await {
        let row = job.row;

        // A panicking row must not take the worker down with it.
        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle_row(row).await })
        };
        let result = match task.await {
            Ok(result) => result,
            Err(err) => Err(ProcessError::Aborted(row, err.to_string())),
        };

        // Failures end here: logged, row left as it was.
        match &result {
            Ok(outcome) => debug!(row, ?outcome, "Row finished"),
            Err(err) => error!(row, "Failed to process row: {}", err),
        }

        if let Some(reply) = job.reply {
            let _ = reply.send(result);
        }
    }

    info!("Request worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::requests::request_config::{RequestConfig, TemplateMode};
    use crate::core::requests::request_models::CellValue;
    use crate::core::requests::request_ports::CollaboratorError;
    use crate::core::requests::request_service::RowProcessor;
    use crate::infra::memory::{InMemoryDrive, InMemoryMailer, InMemorySpreadsheet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    const DATA: &str = "Form Responses 1";

    /// Records how many rows were ever handled at the same time.
    #[derive(Default)]
    struct CountingHandler {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl RowHandler for CountingHandler {
        async fn handle_row(&self, _row: u32) -> Result<RowOutcome, ProcessError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(RowOutcome::AlreadyProcessed)
        }
    }

    /// Holds every job until a permit is released.
    struct GatedHandler {
        started: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl RowHandler for GatedHandler {
        async fn handle_row(&self, _row: u32) -> Result<RowOutcome, ProcessError> {
            self.started.notify_one();
            let permit = self.gate.acquire().await;
            drop(permit);
            Ok(RowOutcome::AlreadyProcessed)
        }
    }

    /// Fails even rows.
    struct FlakyHandler;

    #[async_trait]
    impl RowHandler for FlakyHandler {
        async fn handle_row(&self, row: u32) -> Result<RowOutcome, ProcessError> {
            if row % 2 == 0 {
                Err(CollaboratorError::Render("export timed out".to_string()).into())
            } else {
                Ok(RowOutcome::AlreadyProcessed)
            }
        }
    }

    /// Panics on row 2.
    struct PanickingHandler;

    #[async_trait]
    impl RowHandler for PanickingHandler {
        async fn handle_row(&self, row: u32) -> Result<RowOutcome, ProcessError> {
            if row == 2 {
                panic!("timestamp overflow");
            }
            Ok(RowOutcome::AlreadyProcessed)
        }
    }

    fn gated() -> Arc<GatedHandler> {
        Arc::new(GatedHandler {
            started: Notify::new(),
            gate: Semaphore::new(0),
        })
    }

    #[tokio::test]
    async fn runs_one_row_at_a_time() {
        let handler = Arc::new(CountingHandler::default());
        let (queue, _worker) =
            RequestQueue::start(Arc::clone(&handler), DATA, QueueSettings::default());

        let mut tasks = Vec::new();
        for row in 2..10 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                queue.process(&EditEvent::new(DATA, row)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(handler.handled.load(Ordering::SeqCst), 8);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignores_header_and_foreign_sheets() {
        let handler = Arc::new(CountingHandler::default());
        let (queue, _worker) =
            RequestQueue::start(Arc::clone(&handler), DATA, QueueSettings::default());

        assert!(!queue.dispatch(&EditEvent::new(DATA, 1)).await.unwrap());
        assert_eq!(
            queue
                .process(&EditEvent::new("Request Template", 4))
                .await
                .unwrap(),
            RowOutcome::Ignored
        );
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let handler = gated();
        let settings = QueueSettings {
            capacity: 1,
            backpressure: Backpressure::Reject,
        };
        let (queue, _worker) = RequestQueue::start(Arc::clone(&handler), DATA, settings);

        // First job is taken by the worker and parks on the gate.
        assert!(queue.dispatch(&EditEvent::new(DATA, 2)).await.unwrap());
        handler.started.notified().await;

        // Second fills the only slot, third has nowhere to go.
        assert!(queue.dispatch(&EditEvent::new(DATA, 3)).await.unwrap());
        assert!(matches!(
            queue.dispatch(&EditEvent::new(DATA, 4)).await,
            Err(QueueError::Full)
        ));

        handler.gate.add_permits(10);
    }

    #[tokio::test]
    async fn wait_policy_gives_up_after_the_bound() {
        let handler = gated();
        let settings = QueueSettings {
            capacity: 1,
            backpressure: Backpressure::Wait(Duration::from_millis(30)),
        };
        let (queue, _worker) = RequestQueue::start(Arc::clone(&handler), DATA, settings);

        queue.dispatch(&EditEvent::new(DATA, 2)).await.unwrap();
        handler.started.notified().await;
        queue.dispatch(&EditEvent::new(DATA, 3)).await.unwrap();

        assert!(matches!(
            queue.dispatch(&EditEvent::new(DATA, 4)).await,
            Err(QueueError::TimedOut(_))
        ));

        handler.gate.add_permits(10);
    }

    #[tokio::test]
    async fn failures_are_reported_and_the_worker_keeps_going() {
        let (queue, _worker) =
            RequestQueue::start(Arc::new(FlakyHandler), DATA, QueueSettings::default());

        let failed = queue.process(&EditEvent::new(DATA, 2)).await;
        assert!(matches!(failed, Err(QueueError::Process(_))));

        let next = queue.process(&EditEvent::new(DATA, 3)).await.unwrap();
        assert_eq!(next, RowOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn a_panicking_row_does_not_stop_the_worker() {
        let (queue, _worker) =
            RequestQueue::start(Arc::new(PanickingHandler), DATA, QueueSettings::default());

        let failed = queue.process(&EditEvent::new(DATA, 2)).await;
        assert!(matches!(
            failed,
            Err(QueueError::Process(ProcessError::Aborted(2, _)))
        ));

        let next = queue.process(&EditEvent::new(DATA, 3)).await.unwrap();
        assert_eq!(next, RowOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn huge_serial_timestamp_fails_only_its_own_row() {
        let template = vec![vec![CellValue::from("Request"), CellValue::from("{{ColumC}}")]];
        let mut data = vec![vec![CellValue::from("Timestamp")]];
        for (n, stamp) in [1.0e12, 45605.0].into_iter().enumerate() {
            let mut cells = vec![CellValue::Empty; 40];
            cells[0] = CellValue::Number(stamp);
            cells[2] = CellValue::from(format!("REQ-{}", n));
            cells[3] = CellValue::from("a@x.com");
            cells[4] = CellValue::from("PN1");
            data.push(cells);
        }
        let sheet = Arc::new(
            InMemorySpreadsheet::new()
                .with_sheet(DATA, data)
                .with_sheet("Request Template", template),
        );
        let processor = Arc::new(RowProcessor::new(
            Arc::clone(&sheet),
            Arc::clone(&sheet),
            Arc::new(InMemoryDrive::new()),
            Arc::new(InMemoryMailer::new()),
            RequestConfig::default(),
        ));
        let (queue, _worker) = RequestQueue::start(processor, DATA, QueueSettings::default());

        let bad = queue.process(&EditEvent::new(DATA, 2)).await;
        assert!(matches!(
            bad,
            Err(QueueError::Process(ProcessError::Template(_)))
        ));

        let good = queue.process(&EditEvent::new(DATA, 3)).await.unwrap();
        assert!(matches!(good, RowOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn worker_stops_when_handles_are_dropped() {
        let handler = Arc::new(CountingHandler::default());
        let (queue, worker) =
            RequestQueue::start(Arc::clone(&handler), DATA, QueueSettings::default());

        queue.dispatch(&EditEvent::new(DATA, 2)).await.unwrap();
        drop(queue);
        worker.await.unwrap();

        // Queued work is drained before the worker exits.
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_rows_never_mix_in_a_shared_template() {
        let template = vec![
            vec![CellValue::from("Request"), CellValue::from("{{ColumC}}")],
            vec![CellValue::from("Part"), CellValue::from("{{ColumE}}")],
        ];
        let mut data = vec![vec![CellValue::from("Timestamp")]];
        for n in 0..6 {
            let mut cells = vec![CellValue::Empty; 40];
            cells[0] = CellValue::Number(45605.0);
            cells[2] = CellValue::from(format!("REQ-{}", n));
            cells[3] = CellValue::from("a@x.com");
            cells[4] = CellValue::from(format!("PN-{}", n));
            data.push(cells);
        }

        let sheet = Arc::new(
            InMemorySpreadsheet::new()
                .with_sheet(DATA, data)
                .with_sheet("Request Template", template),
        );
        let mut config = RequestConfig::default();
        config.template_mode = TemplateMode::Shared {
            restore: true,
            refresh_cell: None,
        };
        let processor = Arc::new(RowProcessor::new(
            Arc::clone(&sheet),
            Arc::clone(&sheet),
            Arc::new(InMemoryDrive::new()),
            Arc::new(InMemoryMailer::new()),
            config,
        ));
        let (queue, _worker) = RequestQueue::start(processor, DATA, QueueSettings::default());

        let mut tasks = Vec::new();
        for row in 2..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                queue.process(&EditEvent::new(DATA, row)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let rendered = sheet.rendered();
        assert_eq!(rendered.len(), 6);

        let mut requests = Vec::new();
        for grid in rendered {
            let request = grid[0][1].to_string();
            let part = grid[1][1].to_string();
            assert_eq!(request.trim_start_matches("REQ-"), part.trim_start_matches("PN-"));
            requests.push(request);
        }
        requests.sort();
        let expected: Vec<String> = (0..6).map(|n| format!("REQ-{}", n)).collect();
        assert_eq!(requests, expected);
    }
}
