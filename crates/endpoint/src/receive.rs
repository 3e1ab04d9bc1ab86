//! The receive loop: takes messages off the transport, runs them through
//! the incoming pipeline and applies recoverability decisions.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, error, info, info_span, warn},
};

#[cfg(feature = "metrics")]
use {
    conveyor_metrics::{counter, endpoint as endpoint_metrics, gauge, histogram, labels},
    std::time::Instant,
};
use {
    conveyor_common::{BagStrictness, ContextBag, IncomingMessage, TraceContext, headers},
    conveyor_pipeline::{IncomingPhysicalContext, Pipeline, ServiceProvider},
    conveyor_recoverability::{
        Recoverability, RecoverabilityAction, apply_delayed_retry_headers, apply_fault_headers,
    },
};

use crate::{
    outgoing::{PendingOperations, dispatch_operations},
    transport::{ReceivedMessage, Transport},
};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Shared state of every receive loop of one endpoint.
pub(crate) struct Receiver {
    pub(crate) endpoint: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pipeline: Arc<Pipeline<IncomingPhysicalContext>>,
    pub(crate) recoverability: Arc<Recoverability>,
    pub(crate) services: ServiceProvider,
    pub(crate) strictness: BagStrictness,
    /// Stops taking new messages.
    pub(crate) stop: CancellationToken,
    /// Aborts in-flight pipeline executions.
    pub(crate) abort: CancellationToken,
}

fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<conveyor_pipeline::Error>(),
            Some(conveyor_pipeline::Error::Cancelled)
        )
    })
}

impl Receiver {
    /// Receive from `queue` until stopped, running at most as many messages
    /// at once as `permits` allows. In-flight messages are awaited before
    /// returning.
    pub(crate) async fn run(self: Arc<Self>, queue: String, permits: Arc<Semaphore>) {
        info!(endpoint = %self.endpoint, queue = %queue, "receive loop started");
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                () = self.stop.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let received = tokio::select! {
                () = self.stop.cancelled() => break,
                received = self.transport.receive(&queue) => received,
            };

            match received {
                Ok(Some(received)) => {
                    let receiver = Arc::clone(&self);
                    let queue = queue.clone();
                    in_flight.spawn(async move {
                        receiver.process(&queue, received).await;
                        drop(permit);
                    });
                },
                Ok(None) => {
                    info!(queue = %queue, "transport closed the queue");
                    break;
                },
                Err(error) => {
                    warn!(queue = %queue, error = %error, "receive failed");
                    tokio::select! {
                        () = self.stop.cancelled() => break,
                        () = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {},
                    }
                },
            }

            while let Some(result) = in_flight.try_join_next() {
                if let Err(error) = result {
                    error!(queue = %queue, error = %error, "message task panicked");
                }
            }
        }

        debug!(queue = %queue, pending = in_flight.len(), "draining in-flight messages");
        while let Some(result) = in_flight.join_next().await {
            if let Err(error) = result {
                error!(queue = %queue, error = %error, "message task panicked");
            }
        }
        info!(endpoint = %self.endpoint, queue = %queue, "receive loop stopped");
    }

    /// Process one received message to completion: success, a delayed
    /// retry handed to the transport, or the error queue. When the transport
    /// rejects the chosen action the message goes back to `queue`.
    pub(crate) async fn process(&self, queue: &str, received: ReceivedMessage) {
        let ReceivedMessage {
            message,
            delivery_attempt,
        } = received;
        #[cfg(feature = "metrics")]
        let started = Instant::now();
        #[cfg(feature = "metrics")]
        {
            counter!(endpoint_metrics::MESSAGES_RECEIVED_TOTAL, labels::ENDPOINT => self.endpoint.clone())
                .increment(1);
            gauge!(endpoint_metrics::IN_FLIGHT, labels::ENDPOINT => self.endpoint.clone())
                .increment(1.0);
        }

        let causing = message
            .headers
            .get(headers::TRACE_PARENT)
            .map(String::as_str)
            .and_then(TraceContext::parse);
        let mut attempt = delivery_attempt;

        let success = loop {
            let trace = causing.as_ref().map_or_else(TraceContext::root, TraceContext::child);
            let span = info_span!(
                "receive",
                message_id = %message.message_id,
                queue,
                attempt,
                delayed_retries = message.delayed_retries(),
                trace_id = trace.trace_id(),
                span_id = trace.span_id(),
                parent_span_id = causing.as_ref().map(TraceContext::span_id),
            );
            let outcome = self.process_once(&message, trace).instrument(span).await;
            attempt += 1;
            let error = match outcome {
                Ok(()) => {
                    self.recoverability.record_success(message.message_id.as_str());
                    debug!(message_id = %message.message_id, queue, "message processed");
                    break true;
                },
                Err(error) => error,
            };

            if is_cancellation(&error) {
                info!(message_id = %message.message_id, queue, "processing aborted, returning message to queue");
                self.return_to_queue(&message, queue).await;
                break false;
            }

            let decision = self
                .recoverability
                .evaluate(&message, &error, delivery_attempt);
            match decision.action {
                RecoverabilityAction::ImmediateRetry => continue,
                RecoverabilityAction::DelayedRetry { delay } => {
                    let mut outgoing = message.to_outgoing();
                    apply_delayed_retry_headers(
                        &mut outgoing.headers,
                        message.delayed_retries() + 1,
                        Utc::now(),
                    );
                    if let Err(error) = self
                        .transport
                        .schedule_delayed_delivery(outgoing, queue, delay)
                        .await
                    {
                        // the record stays so the redelivery keeps counting
                        warn!(message_id = %message.message_id, error = %error, "failed to schedule delayed retry, returning message to queue");
                        self.return_to_queue(&message, queue).await;
                    }
                    break false;
                },
                RecoverabilityAction::MoveToError { error_queue } => {
                    let mut outgoing = message.to_outgoing();
                    apply_fault_headers(&mut outgoing.headers, queue, &error, &decision.record);
                    if let Err(error) = self.transport.move_to_error(outgoing, &error_queue).await {
                        warn!(message_id = %message.message_id, error_queue = %error_queue, error = %error, "failed to move message to error queue, returning message to queue");
                        self.return_to_queue(&message, queue).await;
                    }
                    break false;
                },
            }
        };

        #[cfg(feature = "metrics")]
        {
            counter!(
                endpoint_metrics::MESSAGES_PROCESSED_TOTAL,
                labels::ENDPOINT => self.endpoint.clone(),
                labels::SUCCESS => success.to_string()
            )
            .increment(1);
            gauge!(endpoint_metrics::IN_FLIGHT, labels::ENDPOINT => self.endpoint.clone())
                .decrement(1.0);
            histogram!(endpoint_metrics::PROCESSING_DURATION_SECONDS, labels::ENDPOINT => self.endpoint.clone())
                .record(started.elapsed().as_secs_f64());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = success;
    }

    /// Put `message` back on `queue` unchanged so the transport delivers it
    /// again. If even that fails the message is gone and its failure record
    /// is dropped with it.
    async fn return_to_queue(&self, message: &IncomingMessage, queue: &str) {
        if let Err(error) = self.transport.send(message.to_outgoing(), queue).await {
            error!(message_id = %message.message_id, queue, error = %error, "failed to return message to queue");
            self.recoverability.forget(message.message_id.as_str());
        }
    }

    /// One attempt: run the incoming pipeline, then dispatch what the
    /// handlers produced. `trace` is the attempt's span; sends made by the
    /// handlers continue it.
    async fn process_once(&self, message: &IncomingMessage, trace: TraceContext) -> anyhow::Result<()> {
        let pending = Arc::new(PendingOperations::default());
        let mut extensions = ContextBag::new(self.strictness);
        extensions.set(message.clone())?;
        extensions.set(trace)?;
        extensions.set_arc(Arc::clone(&pending))?;

        let mut context =
            IncomingPhysicalContext::new(message.clone(), extensions, self.services.clone());
        self.pipeline.execute(&mut context, &self.abort).await?;

        dispatch_operations(self.transport.as_ref(), pending.take()).await
    }
}
