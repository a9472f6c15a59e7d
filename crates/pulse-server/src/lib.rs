// PulseWatch server
// Axum HTTP/WS front end over the core run machinery. One delivery task
// owns observer fan-out; the registry owns run lifetimes.

use std::net::SocketAddr;
use std::sync::Arc;

use pulse_core::{EventBridge, RunRegistry, RunStore, StagePipeline};

mod delivery;
mod http;

pub use delivery::{spawn_delivery, DeliveryHandle};
pub use http::app_router;

#[derive(Clone)]
pub struct AppState {
    pub registry: RunRegistry,
    pub bridge: EventBridge,
    pub store: Arc<dyn RunStore>,
    pub pipeline: Arc<dyn StagePipeline>,
    pub delivery: DeliveryHandle,
}

impl AppState {
    /// Wires up the delivery task and enables the event bridge
    pub fn new(store: Arc<dyn RunStore>, pipeline: Arc<dyn StagePipeline>) -> Self {
        let delivery = spawn_delivery(store.clone());
        let bridge = EventBridge::new();
        bridge.enable(delivery.sender());
        Self {
            registry: RunRegistry::new(),
            bridge,
            store,
            pipeline,
            delivery,
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
