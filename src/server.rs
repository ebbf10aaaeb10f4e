//! Process wiring: sockets, signaling and the per-call pipeline.

use crate::config::{BridgeConfig, StoreBackend};
use crate::error::{BridgeError, Result, StageResult};
use crate::pipeline::{HandlerDeps, HandlerHandle, HandlerSetup, LocalHangup, VoiceConversationHandler};
use crate::providers::ProviderSet;
use crate::resolver::StaticDirectory;
use crate::rtp::MediaBridge;
use crate::runtime::EventSink;
use crate::sip::sdp::NegotiatedMedia;
use crate::sip::{CallSession, CallStarter, PassThrough, SessionManager, SignalingDeps, SipTransport};
use crate::store::{CallRecordStore, MemoryStore, SqliteStore};
use crate::voices::VoiceRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Starts a [`VoiceConversationHandler`] for each call that goes active.
pub struct PipelineStarter {
    deps: HandlerDeps,
    media: Arc<MediaBridge>,
    cancel: CancellationToken,
}

impl PipelineStarter {
    pub fn new(deps: HandlerDeps, media: Arc<MediaBridge>, cancel: CancellationToken) -> Self {
        Self { deps, media, cancel }
    }
}

impl CallStarter for PipelineStarter {
    fn start(
        &self,
        session: &CallSession,
        media: &NegotiatedMedia,
        hangups: mpsc::UnboundedSender<LocalHangup>,
    ) -> StageResult<Arc<HandlerHandle>> {
        let setup = HandlerSetup {
            call_id: session.call_id.clone(),
            caller: session.caller.clone(),
            called: session.called.clone(),
            mode: session.scheme.mode,
            assistant: session.assistant.clone(),
            voicemail_prompt: session.scheme.voicemail_prompt.clone(),
            record: session.scheme.record && self.deps.config.recording.enabled,
        };
        let mut deps = self.deps.clone();
        deps.hangups = Some(hangups);
        let sink = Box::new(self.media.sender(media.remote, media.payload_type));
        VoiceConversationHandler::spawn(setup, deps, sink, &self.cancel).map(Arc::new)
    }
}

/// Everything a bridge process needs before it binds sockets.
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    store: Arc<dyn CallRecordStore>,
    providers: ProviderSet,
    voices: Arc<VoiceRegistry>,
    events: EventSink,
    passthrough: Option<mpsc::UnboundedSender<PassThrough>>,
}

impl BridgeServer {
    /// Validate `config` and build the configured store, providers and voices.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid settings, or the store/provider
    /// error that prevented startup.
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn CallRecordStore> = match config.store.backend {
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store.path)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        let providers = ProviderSet::from_config(&config)?;
        let voices = match &config.voices.file {
            Some(path) => VoiceRegistry::from_file(path)?,
            None => VoiceRegistry::builtin(),
        };
        Ok(Self::with_parts(config, store, providers, Arc::new(voices)))
    }

    /// Assemble from prebuilt parts.
    pub fn with_parts(
        config: BridgeConfig,
        store: Arc<dyn CallRecordStore>,
        providers: ProviderSet,
        voices: Arc<VoiceRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            providers,
            voices,
            events: EventSink::new(),
            passthrough: None,
        }
    }

    /// Hand unmatched INVITEs to `tx` instead of answering 404.
    pub fn with_passthrough(mut self, tx: mpsc::UnboundedSender<PassThrough>) -> Self {
        self.passthrough = Some(tx);
        self
    }

    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    pub fn store(&self) -> Arc<dyn CallRecordStore> {
        Arc::clone(&self.store)
    }

    /// Bind the SIP and RTP sockets and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if either socket cannot be bound.
    pub async fn start(self) -> Result<RunningBridge> {
        let root = CancellationToken::new();
        let media = MediaBridge::bind(&self.config.media.bind_addr).await?;
        let mut transport = SipTransport::bind(&self.config.signaling.bind_addr).await?;
        if let Some(tx) = self.passthrough {
            transport = transport.with_passthrough(tx);
        }
        let sip_addr = transport.local_addr()?;
        let media_addr = media.local_addr()?;

        let handler_deps = HandlerDeps {
            config: Arc::clone(&self.config),
            providers: self.providers,
            voices: self.voices,
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            hangups: None,
        };
        let directory = Arc::new(StaticDirectory::new(
            self.config.schemes.clone(),
            self.config.assistants.clone(),
        ));
        let starter = PipelineStarter::new(handler_deps, Arc::clone(&media), root.child_token());
        let manager = SessionManager::new(
            SignalingDeps {
                config: Arc::clone(&self.config),
                schemes: directory.clone(),
                assistants: directory,
                store: self.store,
                media: Arc::clone(&media),
                sender: transport.sender(),
                starter: Arc::new(starter),
                events: self.events,
                sip_port: sip_addr.port(),
            },
            root.child_token(),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(&media).run(root.child_token())));
        tasks.push(tokio::spawn(
            transport.run(Arc::clone(&manager), root.child_token()),
        ));
        let hangups = Arc::clone(&manager);
        let hangup_token = root.child_token();
        tasks.push(tokio::spawn(async move {
            hangups.run_hangups(hangup_token).await;
            Ok(())
        }));

        info!(%sip_addr, %media_addr, schemes = self.config.schemes.len(), "bridge started");
        Ok(RunningBridge {
            sip_addr,
            media_addr,
            media,
            manager,
            root,
            tasks,
            shutdown_timeout: Duration::from_millis(self.config.handler.shutdown_timeout_ms),
        })
    }
}

/// A started bridge.
pub struct RunningBridge {
    sip_addr: SocketAddr,
    media_addr: SocketAddr,
    media: Arc<MediaBridge>,
    manager: Arc<SessionManager>,
    root: CancellationToken,
    tasks: Vec<JoinHandle<Result<()>>>,
    shutdown_timeout: Duration,
}

impl RunningBridge {
    pub fn sip_addr(&self) -> SocketAddr {
        self.sip_addr
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.manager)
    }

    /// The shared media socket and its call routes.
    pub fn media(&self) -> Arc<MediaBridge> {
        Arc::clone(&self.media)
    }

    /// Serve until `stop` fires, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns the first error a background task reported.
    pub async fn run_until(self, stop: CancellationToken) -> Result<()> {
        stop.cancelled().await;
        self.shutdown().await
    }

    /// Hang up every call and stop all tasks.
    ///
    /// # Errors
    ///
    /// Returns the first error a background task reported.
    pub async fn shutdown(self) -> Result<()> {
        info!(calls = self.manager.call_count(), "bridge shutting down");
        self.manager.shutdown_all().await;
        self.root.cancel();

        let mut first_error = None;
        for task in self.tasks {
            match tokio::time::timeout(self.shutdown_timeout, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("bridge task failed: {e}");
                    first_error.get_or_insert(e);
                }
                Ok(Err(join)) => {
                    warn!("bridge task panicked: {join}");
                    first_error.get_or_insert(BridgeError::Media(format!("task panicked: {join}")));
                }
                Err(_) => warn!("bridge task did not stop in time"),
            }
        }
        info!("bridge stopped");
        first_error.map_or(Ok(()), Err)
    }
}
