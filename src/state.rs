//! Application state
//!
//! One `AppState` per process wires the core components together and is
//! shared as `Arc<AppState>` by every handler and background task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::core::asr::{AsrBackend, AsrSessionManager};
use crate::core::dispatch::CommandDispatcher;
use crate::core::registry::DeviceRegistry;
use crate::core::tts::{TtsBackend, TtsSender};
use crate::events::EventBus;
use crate::pipeline::{AiResponder, ReplyPipeline};
use crate::proxy::DeviceProxy;

/// Shared gateway state.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub events: EventBus,
    pub registry: Arc<DeviceRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub tts: Arc<TtsSender>,
    pub asr: Arc<AsrSessionManager>,
    pub responder: Arc<AiResponder>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Wire the core around the three external collaborators.
    pub fn new(
        config: GatewayConfig,
        asr_backend: Arc<dyn AsrBackend>,
        tts_backend: Arc<dyn TtsBackend>,
        pipeline: Arc<dyn ReplyPipeline>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let events = EventBus::new();
        let registry = DeviceRegistry::new(config.clone(), events.clone());
        let dispatcher = CommandDispatcher::new(registry.clone(), config.clone());
        let tts = TtsSender::new(registry.clone(), config.clone());
        let responder = AiResponder::new(
            pipeline,
            tts_backend,
            tts.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.clone(),
        );
        let asr = AsrSessionManager::new(
            asr_backend,
            responder.clone(),
            registry.clone(),
            config.clone(),
        );

        Arc::new(Self {
            config,
            events,
            registry,
            dispatcher,
            tts,
            asr,
            responder,
            sweeps: Mutex::new(Vec::new()),
        })
    }

    /// Start the self-healing sweeps (offline devices, pending commands,
    /// abandoned sessions). Handles stay owned by the state.
    pub fn spawn_sweeps(&self) {
        let mut sweeps = self.sweeps.lock();
        sweeps.push(self.registry.spawn_sweep());
        sweeps.push(self.dispatcher.spawn_sweep());
        sweeps.push(self.asr.spawn_sweep());
    }

    /// A proxy facade for one device.
    pub fn proxy(&self, device_id: &str) -> DeviceProxy {
        DeviceProxy::new(
            device_id,
            self.registry.clone(),
            self.dispatcher.clone(),
            self.config.media.clone(),
        )
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        for sweep in self.sweeps.lock().drain(..) {
            sweep.abort();
        }
    }
}
