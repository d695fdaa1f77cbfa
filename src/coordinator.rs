use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use derivative::Derivative;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ForwarderConfig, Rid},
    error::{Error, SessionErrorKind, SinkErrorKind, SourceErrorKind},
    feedback::FeedbackScheduler,
    forwarding_table::ForwardingTable,
    session::{PublisherType, Session, SessionRole, SessionState},
    sink::PacketSink,
    source::PacketSource,
    transport::{PacketWriter, PublishedStream, StreamInfo},
};

/// What a subscriber wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    /// A specific live source.
    Source(String),
    /// A quality layer of a publisher session. The layer does not need to be published yet.
    Layer { publisher_id: String, rid: Rid },
}

/// Lifecycle notifications for the signaling side.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorNotice {
    SourcePublished {
        session_id: String,
        source_id: String,
        rid: Option<Rid>,
    },
    /// The source ended. `sink_ids` were bound to it and are now unbound.
    SourceRetired {
        session_id: String,
        source_id: String,
        sink_ids: Vec<String>,
    },
    SinkDetached {
        session_id: String,
        sink_id: String,
    },
    SessionClosed {
        session_id: String,
    },
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) enum CoordinatorEvent {
    OpenSession(SessionRole, Reply<String>),
    SetPublisherType(String, PublisherType, Reply<()>),
    OfferReceived(String, Reply<()>),
    AnswerSent(String, Reply<()>),
    StreamStarted(String, PublishedStream, Reply<String>),
    SubscriberJoin(
        String,
        SourceSelector,
        #[derivative(Debug = "ignore")] Arc<dyn PacketWriter>,
        Reply<String>,
    ),
    SetPreferredLayer(String, Rid, Reply<()>),
    RequestKeyframe(String, Reply<()>),
    SessionEnded(String, Reply<()>),
    GetSessionState(String, Reply<SessionState>),
    GetSessionRole(String, Reply<SessionRole>),
    GetSourceIds(String, Reply<Vec<String>>),
    GetStreamInfo(SourceSelector, Reply<Option<StreamInfo>>),
    SourceEnded {
        source_id: String,
        error: Option<Error>,
    },
    SinkFailed {
        sink_id: String,
        error: Error,
    },
    Close(Reply<()>),
}

/// SessionCoordinator owns every session of one forwarding domain. Publishers turn their inbound
/// streams into sources, subscribers get sinks bound to those sources.
///
/// The handle is cheap to clone. All state lives in one event loop task, so operations on
/// different sessions never observe a half-applied change.
#[derive(Debug, Clone)]
pub struct SessionCoordinator {
    event_sender: mpsc::UnboundedSender<CoordinatorEvent>,
    notice_sender: broadcast::Sender<CoordinatorNotice>,
    table: Arc<ForwardingTable>,
}

impl SessionCoordinator {
    pub fn new(config: ForwarderConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
        let (notice_sender, _) = broadcast::channel(config.notice_capacity.max(1));
        let table = Arc::new(ForwardingTable::new());

        let state = CoordinatorState {
            config,
            table: table.clone(),
            event_sender: tx.clone(),
            notice_sender: notice_sender.clone(),
            sessions: HashMap::new(),
            sources: HashMap::new(),
            sinks: HashMap::new(),
            parked: HashSet::new(),
        };
        tokio::spawn(async move {
            CoordinatorState::coordinator_event_loop(state, rx).await;
        });

        tracing::debug!("SessionCoordinator is created");

        Self {
            event_sender: tx,
            notice_sender,
            table,
        }
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(Reply<T>) -> CoordinatorEvent,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.event_sender
            .send(event(tx))
            .map_err(|_| Error::coordinator_closed())?;
        rx.await.map_err(|_| Error::coordinator_closed())?
    }

    pub async fn open_publisher(&self) -> Result<String, Error> {
        self.request(|reply| {
            CoordinatorEvent::OpenSession(SessionRole::Publisher(PublisherType::Simple), reply)
        })
        .await
    }

    pub async fn open_subscriber(&self) -> Result<String, Error> {
        self.request(|reply| CoordinatorEvent::OpenSession(SessionRole::Subscriber, reply))
            .await
    }

    /// Only allowed before the publisher has any stream.
    pub async fn set_publisher_type(
        &self,
        session_id: &str,
        publisher_type: PublisherType,
    ) -> Result<(), Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::SetPublisherType(session_id, publisher_type, reply))
            .await
    }

    pub async fn offer_received(&self, session_id: &str) -> Result<(), Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::OfferReceived(session_id, reply))
            .await
    }

    /// Subscribers start streaming once answered. Publishers wait for their first stream.
    pub async fn answer_sent(&self, session_id: &str) -> Result<(), Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::AnswerSent(session_id, reply))
            .await
    }

    /// Creates a source for a new inbound stream of `session_id` and returns its id.
    pub async fn on_publisher_stream_started(
        &self,
        session_id: &str,
        stream: PublishedStream,
    ) -> Result<String, Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::StreamStarted(session_id, stream, reply))
            .await
    }

    /// Creates a sink writing to `writer` and binds it according to `selector`. Returns the sink id.
    pub async fn on_subscriber_join(
        &self,
        session_id: &str,
        selector: SourceSelector,
        writer: Arc<dyn PacketWriter>,
    ) -> Result<String, Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::SubscriberJoin(session_id, selector, writer, reply))
            .await
    }

    pub async fn set_preferred_layer(&self, sink_id: &str, rid: Rid) -> Result<(), Error> {
        let sink_id = sink_id.to_string();
        self.request(|reply| CoordinatorEvent::SetPreferredLayer(sink_id, rid, reply))
            .await
    }

    /// Relays a viewer's keyframe request to the source its sink is bound to.
    pub async fn request_keyframe(&self, sink_id: &str) -> Result<(), Error> {
        let sink_id = sink_id.to_string();
        self.request(|reply| CoordinatorEvent::RequestKeyframe(sink_id, reply))
            .await
    }

    pub async fn on_session_ended(&self, session_id: &str) -> Result<(), Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::SessionEnded(session_id, reply))
            .await
    }

    pub async fn session_state(&self, session_id: &str) -> Result<SessionState, Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::GetSessionState(session_id, reply))
            .await
    }

    pub async fn session_role(&self, session_id: &str) -> Result<SessionRole, Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::GetSessionRole(session_id, reply))
            .await
    }

    /// Live sources of a publisher session, in publication order.
    pub async fn source_ids(&self, session_id: &str) -> Result<Vec<String>, Error> {
        let session_id = session_id.to_string();
        self.request(|reply| CoordinatorEvent::GetSourceIds(session_id, reply))
            .await
    }

    /// Metadata of the source `selector` currently resolves to, `None` if the layer is not
    /// published yet.
    pub async fn stream_info(&self, selector: SourceSelector) -> Result<Option<StreamInfo>, Error> {
        self.request(|reply| CoordinatorEvent::GetStreamInfo(selector, reply))
            .await
    }

    pub async fn bound_source(&self, sink_id: &str) -> Option<String> {
        self.table.source_of(sink_id).await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<CoordinatorNotice> {
        self.notice_sender.subscribe()
    }

    /// Resolves once `session_id` is closed, whichever way that happens: `on_session_ended`, a
    /// fatal sink failure or `close`. An unknown session counts as closed.
    pub async fn session_closed(&self, session_id: &str) {
        let mut notices = self.subscribe_notices();
        loop {
            match self.session_state(session_id).await {
                Ok(state) if state != SessionState::Closed => {}
                _ => return,
            }
            loop {
                match notices.recv().await {
                    Ok(CoordinatorNotice::SessionClosed { session_id: closed })
                        if closed == session_id =>
                    {
                        return
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Session id={} missed {} notices, checking its state",
                            session_id,
                            skipped
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    /// Ends every session and stops the event loop.
    pub async fn close(&self) -> Result<(), Error> {
        self.request(CoordinatorEvent::Close).await
    }
}

struct LiveSource {
    source: Arc<PacketSource>,
    token: CancellationToken,
}

struct SinkEntry {
    sink: Arc<PacketSink>,
    selector: SourceSelector,
}

struct CoordinatorState {
    config: ForwarderConfig,
    table: Arc<ForwardingTable>,
    event_sender: mpsc::UnboundedSender<CoordinatorEvent>,
    notice_sender: broadcast::Sender<CoordinatorNotice>,
    sessions: HashMap<String, Session>,
    sources: HashMap<String, LiveSource>,
    sinks: HashMap<String, SinkEntry>,
    /// Sinks waiting for their layer to be published.
    parked: HashSet<String>,
}

impl CoordinatorState {
    async fn coordinator_event_loop(
        mut state: CoordinatorState,
        mut event_receiver: mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) {
        tracing::debug!("SessionCoordinator event loop started");
        while let Some(event) = event_receiver.recv().await {
            match event {
                CoordinatorEvent::OpenSession(role, reply) => {
                    let session = Session::new(role);
                    let id = session.id.clone();
                    state.sessions.insert(id.clone(), session);
                    let _ = reply.send(Ok(id));
                }
                CoordinatorEvent::SetPublisherType(session_id, publisher_type, reply) => {
                    let _ = reply.send(state.set_publisher_type(&session_id, publisher_type));
                }
                CoordinatorEvent::OfferReceived(session_id, reply) => {
                    let res = state
                        .session_mut(&session_id)
                        .and_then(|session| session.transition(SessionState::Negotiating));
                    let _ = reply.send(res);
                }
                CoordinatorEvent::AnswerSent(session_id, reply) => {
                    let _ = reply.send(state.answer_sent(&session_id));
                }
                CoordinatorEvent::StreamStarted(session_id, stream, reply) => {
                    let res = state.stream_started(&session_id, stream).await;
                    let _ = reply.send(res);
                }
                CoordinatorEvent::SubscriberJoin(session_id, selector, writer, reply) => {
                    let res = state.subscriber_join(&session_id, selector, writer).await;
                    let _ = reply.send(res);
                }
                CoordinatorEvent::SetPreferredLayer(sink_id, rid, reply) => {
                    let res = state.set_preferred_layer(&sink_id, rid).await;
                    let _ = reply.send(res);
                }
                CoordinatorEvent::RequestKeyframe(sink_id, reply) => {
                    let res = state.request_keyframe(&sink_id).await;
                    let _ = reply.send(res);
                }
                CoordinatorEvent::SessionEnded(session_id, reply) => {
                    let res = state.end_session(&session_id).await;
                    let _ = reply.send(res);
                }
                CoordinatorEvent::GetSessionState(session_id, reply) => {
                    let res = state.session(&session_id).map(|session| session.state);
                    let _ = reply.send(res);
                }
                CoordinatorEvent::GetSessionRole(session_id, reply) => {
                    let res = state.session(&session_id).map(|session| session.role);
                    let _ = reply.send(res);
                }
                CoordinatorEvent::GetSourceIds(session_id, reply) => {
                    let res = state
                        .session(&session_id)
                        .map(|session| session.source_ids.clone());
                    let _ = reply.send(res);
                }
                CoordinatorEvent::GetStreamInfo(selector, reply) => {
                    let res = state.resolve(&selector).map(|source_id| {
                        source_id
                            .and_then(|id| state.sources.get(&id))
                            .map(|live| live.source.info.clone())
                    });
                    let _ = reply.send(res);
                }
                CoordinatorEvent::SourceEnded { source_id, error } => {
                    if let Some(err) = error.as_ref() {
                        tracing::debug!("Source id={} ended with error: {}", source_id, err);
                    }
                    state.retire_source(&source_id).await;
                }
                CoordinatorEvent::SinkFailed { sink_id, error } => {
                    tracing::error!("Sink id={} failed: {}", sink_id, error);
                    state.sink_failed(&sink_id).await;
                }
                CoordinatorEvent::Close(reply) => {
                    state.close_all().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }
        tracing::debug!("SessionCoordinator event loop finished");
    }

    fn notify(&self, notice: CoordinatorNotice) {
        tracing::debug!("SessionCoordinator notice: {:?}", notice);
        let _ = self.notice_sender.send(notice);
    }

    fn session(&self, session_id: &str) -> Result<&Session, Error> {
        self.sessions.get(session_id).ok_or_else(|| {
            Error::new_session(
                format!("Session {} is not found", session_id),
                SessionErrorKind::SessionNotFoundError,
            )
        })
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session, Error> {
        self.sessions.get_mut(session_id).ok_or_else(|| {
            Error::new_session(
                format!("Session {} is not found", session_id),
                SessionErrorKind::SessionNotFoundError,
            )
        })
    }

    fn set_publisher_type(
        &mut self,
        session_id: &str,
        publisher_type: PublisherType,
    ) -> Result<(), Error> {
        let session = self.session_mut(session_id)?;
        session.expect_publisher()?;
        if !session.source_ids.is_empty()
            || matches!(session.state, SessionState::Streaming | SessionState::Closed)
        {
            return Err(Error::new_session(
                format!(
                    "Publisher type of session {} can not change while {}",
                    session_id, session.state
                ),
                SessionErrorKind::InvalidStateTransitionError,
            ));
        }
        tracing::debug!(
            "Session id={} publisher type is {:?}",
            session_id,
            publisher_type
        );
        session.role = SessionRole::Publisher(publisher_type);
        Ok(())
    }

    fn answer_sent(&mut self, session_id: &str) -> Result<(), Error> {
        let session = self.session_mut(session_id)?;
        match session.role {
            SessionRole::Subscriber => session.transition(SessionState::Streaming),
            SessionRole::Publisher(_) => match session.state {
                SessionState::Negotiating | SessionState::Streaming => Ok(()),
                state => Err(Error::new_session(
                    format!("Session {} has not received an offer, state {}", session_id, state),
                    SessionErrorKind::InvalidStateTransitionError,
                )),
            },
        }
    }

    async fn stream_started(
        &mut self,
        session_id: &str,
        stream: PublishedStream,
    ) -> Result<String, Error> {
        let session = self.session(session_id)?;
        let publisher_type = session.expect_publisher()?;
        if !session.state.can_transition_to(SessionState::Streaming) {
            return Err(Error::new_session(
                format!(
                    "Session {} can not publish a stream while {}",
                    session_id, session.state
                ),
                SessionErrorKind::InvalidStateTransitionError,
            ));
        }

        let source = Arc::new(PacketSource::new(session_id.to_string(), stream));

        if publisher_type == PublisherType::Simulcast {
            let Some(rid) = source.rid else {
                return Err(Error::new_source(
                    format!(
                        "Simulcast stream ssrc={} has no valid layer tag: {:?}",
                        source.ssrc(),
                        source.info.rid
                    ),
                    SourceErrorKind::LayerNotFoundError,
                ));
            };
            if self.layer_source(session_id, rid).is_some() {
                return Err(Error::new_source(
                    format!("Layer {} of session {} is already published", rid, session_id),
                    SourceErrorKind::LayerAlreadyPublishedError,
                ));
            }
        }

        self.table.add_source(&source.id).await;
        let token = CancellationToken::new();
        source.spawn_read_loop(self.table.clone(), self.event_sender.clone(), token.clone());

        let remb_bitrate = match publisher_type {
            PublisherType::Simulcast => Some(self.config.remb_bitrate),
            PublisherType::Simple => None,
        };
        FeedbackScheduler::new(self.config.feedback_interval, remb_bitrate).spawn(
            source.id.clone(),
            source.ssrc(),
            source.feedback_sender(),
            token.child_token(),
        );

        let source_id = source.id.clone();
        let rid = source.rid;
        let session = self.session_mut(session_id)?;
        session.transition(SessionState::Streaming)?;
        session.source_ids.push(source_id.clone());
        self.sources.insert(
            source_id.clone(),
            LiveSource {
                source,
                token,
            },
        );

        self.bind_parked(session_id, publisher_type, &source_id, rid)
            .await;

        tracing::info!(
            "Session id={} published source={} rid={:?}",
            session_id,
            source_id,
            rid
        );
        self.notify(CoordinatorNotice::SourcePublished {
            session_id: session_id.to_string(),
            source_id: source_id.clone(),
            rid,
        });
        Ok(source_id)
    }

    async fn bind_parked(
        &mut self,
        publisher_id: &str,
        publisher_type: PublisherType,
        source_id: &str,
        source_rid: Option<Rid>,
    ) {
        let waiting: Vec<String> = self
            .parked
            .iter()
            .filter(|sink_id| {
                self.sinks.get(*sink_id).is_some_and(|entry| match &entry.selector {
                    SourceSelector::Layer { publisher_id: p, rid } => {
                        p == publisher_id
                            && (source_rid == Some(*rid)
                                || publisher_type == PublisherType::Simple)
                    }
                    SourceSelector::Source(_) => false,
                })
            })
            .cloned()
            .collect();

        for sink_id in waiting {
            self.parked.remove(&sink_id);
            let Some(entry) = self.sinks.get(&sink_id) else {
                continue;
            };
            if let Err(err) = self.table.attach(entry.sink.clone(), source_id).await {
                tracing::error!("Failed to bind parked sink id={}: {}", sink_id, err);
                self.parked.insert(sink_id);
            }
        }
    }

    fn layer_source(&self, publisher_id: &str, rid: Rid) -> Option<String> {
        let session = self.sessions.get(publisher_id)?;
        session
            .source_ids
            .iter()
            .find(|id| {
                self.sources
                    .get(*id)
                    .is_some_and(|live| live.source.rid == Some(rid))
            })
            .cloned()
    }

    /// Source id `selector` binds to right now. `None` means the sink has to wait.
    fn resolve(&self, selector: &SourceSelector) -> Result<Option<String>, Error> {
        match selector {
            SourceSelector::Source(source_id) => {
                if self.sources.contains_key(source_id) {
                    Ok(Some(source_id.clone()))
                } else {
                    Err(Error::new_source(
                        format!("Source {} is not found", source_id),
                        SourceErrorKind::SourceNotFoundError,
                    ))
                }
            }
            SourceSelector::Layer { publisher_id, rid } => {
                let publisher = self.session(publisher_id)?;
                let publisher_type = publisher.expect_publisher()?;
                if let Some(source_id) = self.layer_source(publisher_id, *rid) {
                    return Ok(Some(source_id));
                }
                if publisher_type == PublisherType::Simple {
                    tracing::debug!(
                        "Publisher id={} has no layer {}, using any of its sources",
                        publisher_id,
                        rid
                    );
                    return Ok(publisher.source_ids.first().cloned());
                }
                Ok(None)
            }
        }
    }

    async fn subscriber_join(
        &mut self,
        session_id: &str,
        selector: SourceSelector,
        writer: Arc<dyn PacketWriter>,
    ) -> Result<String, Error> {
        let session = self.session(session_id)?;
        session.expect_subscriber()?;
        if session.state == SessionState::Closed {
            return Err(Error::new_session(
                format!("Session {} is closed", session_id),
                SessionErrorKind::InvalidStateTransitionError,
            ));
        }

        let target = self.resolve(&selector)?;
        let sink = Arc::new(PacketSink::new(session_id.to_string(), writer));
        let sink_id = sink.id.clone();

        match target.as_ref() {
            Some(source_id) => {
                self.table.attach(sink.clone(), source_id).await?;
            }
            None => {
                tracing::debug!(
                    "Sink id={} is parked until {:?} is published",
                    sink_id,
                    selector
                );
                self.parked.insert(sink_id.clone());
            }
        }

        self.sinks
            .insert(sink_id.clone(), SinkEntry { sink, selector });
        self.session_mut(session_id)?.sink_ids.push(sink_id.clone());
        Ok(sink_id)
    }

    fn sink_entry(&self, sink_id: &str) -> Result<&SinkEntry, Error> {
        self.sinks.get(sink_id).ok_or_else(|| {
            Error::new_sink(
                format!("Sink {} is not found", sink_id),
                SinkErrorKind::SinkNotFoundError,
            )
        })
    }

    async fn set_preferred_layer(&mut self, sink_id: &str, rid: Rid) -> Result<(), Error> {
        let entry = self.sink_entry(sink_id)?;
        let SourceSelector::Layer { publisher_id, .. } = &entry.selector else {
            return Err(Error::new_source(
                format!("Sink {} is not bound to a layer", sink_id),
                SourceErrorKind::LayerNotFoundError,
            ));
        };
        let publisher_id = publisher_id.clone();
        let source_id = self.layer_source(&publisher_id, rid).ok_or_else(|| {
            Error::new_source(
                format!("Layer {} of publisher {} is not published", rid, publisher_id),
                SourceErrorKind::LayerNotFoundError,
            )
        })?;

        self.table.attach(entry.sink.clone(), &source_id).await?;
        tracing::debug!("Sink id={} switched to layer {}", sink_id, rid);

        self.parked.remove(sink_id);
        if let Some(entry) = self.sinks.get_mut(sink_id) {
            entry.selector = SourceSelector::Layer { publisher_id, rid };
        }
        Ok(())
    }

    async fn request_keyframe(&self, sink_id: &str) -> Result<(), Error> {
        self.sink_entry(sink_id)?;
        let Some(source_id) = self.table.source_of(sink_id).await else {
            tracing::debug!("Sink id={} is not bound, keyframe request ignored", sink_id);
            return Ok(());
        };
        match self.sources.get(&source_id) {
            Some(live) => live.source.request_keyframe(),
            None => Ok(()),
        }
    }

    /// Exactly once per source: later calls for the same id do nothing.
    async fn retire_source(&mut self, source_id: &str) {
        let Some(live) = self.sources.remove(source_id) else {
            return;
        };
        live.token.cancel();

        let sinks = self.table.remove_source(source_id).await;
        let sink_ids: Vec<String> = sinks.iter().map(|sink| sink.id.clone()).collect();

        let session_id = live.source.session_id.clone();
        let publisher_live = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.source_ids.retain(|id| id != source_id);
                session.state != SessionState::Closed
            }
            None => false,
        };

        // Layer sinks wait for the layer to come back while the publisher is alive.
        if publisher_live {
            for sink_id in sink_ids.iter() {
                if let Some(SinkEntry {
                    selector: SourceSelector::Layer { .. },
                    ..
                }) = self.sinks.get(sink_id)
                {
                    self.parked.insert(sink_id.clone());
                }
            }
        }

        tracing::info!(
            "Source id={} of session={} is retired, {} sinks unbound",
            source_id,
            session_id,
            sink_ids.len()
        );
        self.notify(CoordinatorNotice::SourceRetired {
            session_id,
            source_id: source_id.to_string(),
            sink_ids,
        });
    }

    async fn sink_failed(&mut self, sink_id: &str) {
        let Some(entry) = self.sinks.get(sink_id) else {
            return;
        };
        let session_id = entry.sink.session_id.clone();
        self.remove_sink(sink_id).await;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.sink_ids.retain(|id| id != sink_id);
        }
        self.notify(CoordinatorNotice::SinkDetached {
            session_id: session_id.clone(),
            sink_id: sink_id.to_string(),
        });

        if let Err(err) = self.end_session(&session_id).await {
            tracing::debug!("Session id={} is already closed: {}", session_id, err);
        }
    }

    async fn remove_sink(&mut self, sink_id: &str) {
        self.table.detach(sink_id).await;
        self.parked.remove(sink_id);
        self.sinks.remove(sink_id);
    }

    async fn end_session(&mut self, session_id: &str) -> Result<(), Error> {
        let session = self.session_mut(session_id)?;
        session.transition(SessionState::Closed)?;
        let source_ids = std::mem::take(&mut session.source_ids);
        let sink_ids = std::mem::take(&mut session.sink_ids);

        for source_id in source_ids {
            self.retire_source(&source_id).await;
        }
        for sink_id in sink_ids {
            self.remove_sink(&sink_id).await;
        }

        // Sinks of other sessions waiting for this publisher stay unbound.
        let orphaned: Vec<String> = self
            .parked
            .iter()
            .filter(|sink_id| {
                self.sinks.get(*sink_id).is_some_and(|entry| {
                    matches!(&entry.selector, SourceSelector::Layer { publisher_id, .. } if publisher_id == session_id)
                })
            })
            .cloned()
            .collect();
        for sink_id in orphaned {
            self.parked.remove(&sink_id);
        }

        tracing::info!("Session id={} is closed", session_id);
        self.notify(CoordinatorNotice::SessionClosed {
            session_id: session_id.to_string(),
        });
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn close_all(&mut self) {
        let session_ids: Vec<String> = self.sessions.keys().cloned().collect();
        for session_id in session_ids {
            if let Err(err) = self.end_session(&session_id).await {
                tracing::error!("Failed to close session id={}: {}", session_id, err);
            }
        }
    }
}
