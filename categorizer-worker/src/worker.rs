use std::time;

use categorizer_common::classifier::Classifier;
use categorizer_common::event::{CategorizedEvent, ProjectEvent};
use categorizer_common::metrics_consts::{
    CONNECTION_ATTEMPTS, DELIVERIES, PUBLISH_DURATION, SESSIONS_LOST, SETTLEMENT_FAILED,
};
use categorizer_common::time::{SystemTime, TimeSource};
use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Connector, Delivery, Session, Topology};
use crate::error::DeliveryError;

/// Lower bound for the readiness heartbeat, `tokio::time::interval` rejects a zero period.
const MIN_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Fixed delay between attempts to (re)establish a broker session. Attempts never stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: time::Duration,
}

impl ReconnectPolicy {
    pub fn new(delay: time::Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> time::Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: time::Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub topology: Topology,
    /// Routing key of the republished, categorized events.
    pub categorized_routing_key: String,
    /// Maximum number of unacknowledged deliveries handed to the worker.
    pub prefetch_count: u16,
    pub reconnect: ReconnectPolicy,
    /// How often the worker reports readiness while idle.
    pub heartbeat_interval: time::Duration,
}

/// States of the worker's connection lifecycle.
///
/// `Disconnected -> Connecting -> TopologyReady -> Consuming`, falling back to
/// `Disconnected` whenever the session is lost. `Stopped` is terminal and reached
/// from any state once shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    TopologyReady,
    Consuming,
    Stopped,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A categorized event was published, then the delivery acked.
    Published,
    /// The event lacked a project id or description; acked without publishing.
    Skipped,
    /// The delivery could not be processed; rejected without requeue.
    Rejected,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Published => "published",
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Rejected => "rejected",
        }
    }
}

enum Next {
    Shutdown,
    Heartbeat,
    Delivery(Option<Result<Delivery, BrokerError>>),
}

/// Decode a delivery body into a project event. The body must be a UTF-8 JSON object.
pub fn decode_project_event(body: &[u8]) -> Result<ProjectEvent, DeliveryError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(DeliveryError::Decode)?;

    if !value.is_object() {
        return Err(DeliveryError::NotAnObject);
    }

    serde_json::from_value(value).map_err(DeliveryError::Shape)
}

/// Consumes project events, classifies them and republishes them as categorized events.
///
/// The worker owns its broker sessions and drives them from a single task: it
/// consumes and publishes on the same channel and fully settles each delivery before
/// taking the next one.
pub struct CategorizationWorker<C: Connector> {
    connector: C,
    settings: PipelineSettings,
    classifier: Classifier,
    timesource: Box<dyn TimeSource + Send + Sync>,
    /// Readiness handle, reported healthy only while consuming.
    liveness: HealthHandle,
    state: WorkerState,
}

impl<C: Connector> CategorizationWorker<C> {
    pub fn new(
        connector: C,
        settings: PipelineSettings,
        classifier: Classifier,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            connector,
            settings,
            classifier,
            timesource: Box::new(SystemTime::default()),
            liveness,
            state: WorkerState::Disconnected,
        }
    }

    pub fn with_timesource<T: TimeSource + Send + Sync + 'static>(mut self, timesource: T) -> Self {
        self.timesource = Box::new(timesource);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run the worker until `shutdown` is cancelled.
    ///
    /// Broker failures never end this loop: sessions are re-established with the
    /// configured reconnect policy. On shutdown, a delivery being processed is
    /// settled before the session is closed.
    pub async fn connect_and_run(&mut self, shutdown: CancellationToken) {
        let mut session: Option<C::Session> = None;

        while self.state != WorkerState::Stopped {
            let next = self.step(&mut session, &shutdown).await;
            self.transition(next).await;
        }

        if let Some(mut session) = session.take() {
            if let Err(e) = session.close().await {
                warn!("failed to close broker session: {}", e);
            }
        }

        info!("categorization worker stopped");
    }

    async fn transition(&mut self, next: WorkerState) {
        if next == self.state {
            return;
        }

        debug!(from = ?self.state, to = ?next, "worker state transition");

        if matches!(next, WorkerState::Disconnected | WorkerState::Stopped) {
            self.liveness.report_unhealthy().await;
        }

        self.state = next;
    }

    /// Execute the current state and return the next one.
    async fn step(
        &mut self,
        session: &mut Option<C::Session>,
        shutdown: &CancellationToken,
    ) -> WorkerState {
        if shutdown.is_cancelled() {
            return WorkerState::Stopped;
        }

        match self.state {
            WorkerState::Disconnected => {
                if let Some(mut lost) = session.take() {
                    counter!(SESSIONS_LOST).increment(1);
                    if let Err(e) = lost.close().await {
                        debug!("failed to close lost broker session: {}", e);
                    }
                }
                WorkerState::Connecting
            }
            WorkerState::Connecting => match self.open_session().await {
                Ok(opened) => {
                    *session = Some(opened);
                    WorkerState::TopologyReady
                }
                Err(e) => {
                    warn!(
                        "broker unavailable, retrying in {:?}: {}",
                        self.settings.reconnect.delay(),
                        e
                    );
                    match self.pause(shutdown).await {
                        true => WorkerState::Stopped,
                        false => WorkerState::Connecting,
                    }
                }
            },
            WorkerState::TopologyReady => {
                let Some(active) = session.as_mut() else {
                    return WorkerState::Disconnected;
                };

                match active
                    .consume(&self.settings.topology.queue, self.settings.prefetch_count)
                    .await
                {
                    Ok(()) => {
                        info!(
                            queue = %self.settings.topology.queue,
                            prefetch = self.settings.prefetch_count,
                            "waiting for project events"
                        );
                        WorkerState::Consuming
                    }
                    Err(e) => {
                        warn!("failed to register consumer: {}", e);
                        match self.pause(shutdown).await {
                            true => WorkerState::Stopped,
                            false => WorkerState::Disconnected,
                        }
                    }
                }
            }
            WorkerState::Consuming => {
                let Some(active) = session.as_mut() else {
                    return WorkerState::Disconnected;
                };
                self.consume(active, shutdown).await
            }
            WorkerState::Stopped => WorkerState::Stopped,
        }
    }

    /// Connect and declare the topology on the new session.
    async fn open_session(&self) -> Result<C::Session, BrokerError> {
        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                counter!(CONNECTION_ATTEMPTS, "result" => "failed").increment(1);
                return Err(e);
            }
        };

        if let Err(e) = session.declare_topology(&self.settings.topology).await {
            counter!(CONNECTION_ATTEMPTS, "result" => "failed").increment(1);
            if let Err(close_error) = session.close().await {
                debug!("failed to close broker session: {}", close_error);
            }
            return Err(e);
        }

        counter!(CONNECTION_ATTEMPTS, "result" => "connected").increment(1);

        Ok(session)
    }

    /// Wait for the reconnect delay. Returns true if shutdown was requested meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.settings.reconnect.delay()) => false,
        }
    }

    /// Process deliveries one at a time until shutdown or until the session is lost.
    async fn consume(&self, session: &mut C::Session, shutdown: &CancellationToken) -> WorkerState {
        let mut heartbeat = tokio::time::interval(
            self.settings
                .heartbeat_interval
                .max(MIN_HEARTBEAT_INTERVAL),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Next::Shutdown,
                _ = heartbeat.tick() => Next::Heartbeat,
                delivery = session.next_delivery() => Next::Delivery(delivery),
            };

            match next {
                Next::Shutdown => return WorkerState::Stopped,
                Next::Heartbeat => self.liveness.report_healthy().await,
                Next::Delivery(None) => {
                    warn!("delivery stream closed by the broker");
                    return WorkerState::Disconnected;
                }
                Next::Delivery(Some(Err(e))) => {
                    warn!("lost broker session: {}", e);
                    return WorkerState::Disconnected;
                }
                Next::Delivery(Some(Ok(delivery))) => {
                    if let Err(e) = self.handle_delivery(session, delivery).await {
                        error!("dropping broker session: {}", e);
                        counter!(SETTLEMENT_FAILED).increment(1);
                        return WorkerState::Disconnected;
                    }
                    self.liveness.report_healthy().await;
                }
            }
        }
    }

    /// Process one delivery and settle it exactly once.
    ///
    /// The delivery is acked only after its categorized event was published, or
    /// right away if the event is not classifiable. Any processing error rejects it
    /// without requeue, since a message that failed once will fail again. An `Err`
    /// means the settlement itself failed and the session can no longer be trusted.
    pub async fn handle_delivery(
        &self,
        session: &C::Session,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let tag = delivery.tag;

        let outcome = match self.process(session, &delivery).await {
            Ok(Some(event)) => {
                session.ack(tag).await?;
                info!(
                    project_id = %event.project_id,
                    main_category = %event.main_category,
                    delivery_tag = %tag,
                    "project categorized"
                );
                DeliveryOutcome::Published
            }
            Ok(None) => {
                session.ack(tag).await?;
                DeliveryOutcome::Skipped
            }
            Err(e) => {
                error!(
                    delivery_tag = %tag,
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    reason = e.reason(),
                    "rejecting delivery without requeue: {}",
                    e
                );
                session.reject(tag).await?;
                DeliveryOutcome::Rejected
            }
        };

        counter!(DELIVERIES, "outcome" => outcome.as_str()).increment(1);

        Ok(outcome)
    }

    async fn process(
        &self,
        session: &C::Session,
        delivery: &Delivery,
    ) -> Result<Option<CategorizedEvent>, DeliveryError> {
        let event = decode_project_event(&delivery.body)?;

        let Some(project) = event.classifiable() else {
            info!(
                delivery_tag = %delivery.tag,
                "project event without projectId or description, dropping it"
            );
            return Ok(None);
        };

        debug!(project_id = %project.project_id, "classifying project");
        let classification = self
            .classifier
            .classify(project.title, project.description)
            .await;

        let categorized = CategorizedEvent::new(
            project.project_id,
            classification,
            self.timesource.epoch_seconds(),
            event.event_type.clone(),
        );

        self.publish_categorized(session, &categorized).await?;

        Ok(Some(categorized))
    }

    /// Publish a categorized event to the project exchange under the categorized routing key.
    pub async fn publish_categorized(
        &self,
        session: &C::Session,
        event: &CategorizedEvent,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::to_vec(event).map_err(DeliveryError::Encode)?;

        let start = time::Instant::now();
        session
            .publish(
                &self.settings.topology.exchange,
                &self.settings.categorized_routing_key,
                &payload,
            )
            .await?;
        histogram!(PUBLISH_DURATION).record(start.elapsed().as_secs_f64());

        debug!(
            project_id = %event.project_id,
            routing_key = %self.settings.categorized_routing_key,
            "published categorized event"
        );

        Ok(())
    }
}
