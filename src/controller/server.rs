//! Controller process: wires every component and runs until Ctrl-C

use crate::cluster::{HeartbeatDetector, NodeRegistry, QuorumMonitor};
use crate::common::{ConditionKind, ConditionLog, ControllerConfig, Result};
use crate::controller::http::{create_router, AdminState};
use crate::controller::scheduler::Scheduler;
use crate::manifest::Manifest;
use crate::reconcile::{HttpRuntime, MemoryRuntime, Reconciler, ReconcilerConfig, WorkloadRuntime};
use crate::router::{FailoverRouter, HttpIngress, Ingress, LogIngress};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

const CONDITION_LOG_CAPACITY: usize = 256;

/// Every long-lived component, shared between tasks
pub struct Components {
    pub registry: Arc<NodeRegistry>,
    pub conditions: Arc<ConditionLog>,
    pub quorum: Arc<QuorumMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub router: Arc<FailoverRouter>,
    pub scheduler: Arc<Scheduler>,
}

impl Components {
    /// Build components around an already populated registry
    pub fn new(
        config: &ControllerConfig,
        registry: Arc<NodeRegistry>,
        runtime: Arc<dyn WorkloadRuntime>,
        ingress: Arc<dyn Ingress>,
    ) -> Self {
        let conditions = Arc::new(ConditionLog::new(CONDITION_LOG_CAPACITY));
        let quorum = Arc::new(QuorumMonitor::new(registry.clone(), conditions.clone()));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            quorum.clone(),
            runtime,
            conditions.clone(),
            ReconcilerConfig::from(config),
        ));
        let router = Arc::new(FailoverRouter::new(
            registry.clone(),
            ingress,
            reconciler.subscribe_serving(),
            config.action_timeout(),
        ));
        Self {
            registry,
            conditions,
            quorum,
            reconciler,
            router,
            scheduler: Arc::new(Scheduler::new()),
        }
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            registry: self.registry.clone(),
            quorum: self.quorum.clone(),
            reconciler: self.reconciler.clone(),
            router: self.router.clone(),
            scheduler: self.scheduler.clone(),
            conditions: self.conditions.clone(),
        }
    }

    /// Trigger a pass on every registry change and record node conditions
    pub fn start_event_forwarder(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let scheduler = self.scheduler.clone();
        let conditions = self.conditions.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            if event.is_loss() {
                                conditions.report(
                                    ConditionKind::NodeUnreachable,
                                    Some(event.node_id.clone()),
                                    format!("node {} lost", event.node_id),
                                );
                            } else if let crate::cluster::NodeChange::Health {
                                from: crate::cluster::NodeHealth::Unreachable,
                                ..
                            } = event.change
                            {
                                conditions.report(
                                    ConditionKind::NodeRecovered,
                                    Some(event.node_id.clone()),
                                    format!("node {} reachable again", event.node_id),
                                );
                            }
                            scheduler.trigger();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event forwarder lagged; triggering pass");
                            scheduler.trigger();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

pub struct Controller {
    config: ControllerConfig,
    simulate: bool,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            simulate: false,
        }
    }

    /// Run replicas in-process instead of calling node agents
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        tracing::info!("Starting minifleet controller {}", crate::VERSION);
        tracing::info!("  Admin API: {}", config.bind_addr);
        tracing::info!("  Manifest: {}", config.manifest_path.display());
        tracing::info!(
            "  Reconcile every {:?}, heartbeat timeout {:?}",
            config.reconcile_interval(),
            config.heartbeat_timeout()
        );

        let manifest = Manifest::load(&config.manifest_path)?;
        let registry = Arc::new(NodeRegistry::new());
        manifest.bootstrap(&registry)?;

        let runtime: Arc<dyn WorkloadRuntime> = if self.simulate {
            tracing::warn!("Simulation mode: replicas run in-process");
            Arc::new(MemoryRuntime::new())
        } else {
            Arc::new(HttpRuntime::new(config.action_timeout())?)
        };
        let ingress: Arc<dyn Ingress> = match &config.ingress_url {
            Some(url) => Arc::new(HttpIngress::new(url.clone(), config.action_timeout())?),
            None => {
                tracing::info!("No ingress URL configured; endpoint changes are only logged");
                Arc::new(LogIngress)
            }
        };

        let components = Components::new(&config, registry.clone(), runtime, ingress);
        components
            .reconciler
            .set_desired(manifest.desired_state());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let detector = HeartbeatDetector::new(
            registry.clone(),
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
        )
        .start(shutdown_rx.clone());
        let router = components
            .router
            .clone()
            .start(config.router_interval(), shutdown_rx.clone());
        let forwarder = components.start_event_forwarder(shutdown_rx.clone());
        let reconciler = components.reconciler.clone();
        let scheduler = components.scheduler.clone();
        let follow_up = config.heartbeat_interval();
        let worker = components.scheduler.clone().start(
            config.reconcile_interval(),
            shutdown_rx.clone(),
            move || {
                let reconciler = reconciler.clone();
                let scheduler = scheduler.clone();
                async move {
                    let report = reconciler.run_pass().await;
                    // Check on provisioning replicas sooner than the next tick
                    if report.pending > 0 {
                        tokio::spawn(async move {
                            tokio::time::sleep(follow_up).await;
                            scheduler.trigger();
                        });
                    }
                }
            },
        );

        let app = create_router(components.admin_state());
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!("Controller ready");

        let mut server_shutdown = shutdown_rx.clone();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        });
        let server = tokio::spawn(async move { server.await });

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        // Receivers live in the tasks below; a send error only means they are gone
        let _ = shutdown_tx.send(true);

        for (name, handle) in [
            ("detector", detector),
            ("router", router),
            ("forwarder", forwarder),
            ("scheduler", worker),
        ] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Task ended abnormally");
            }
        }
        match server.await {
            Ok(Err(e)) => tracing::error!("Admin server error: {}", e),
            Err(e) => tracing::error!("Admin server task failed: {}", e),
            Ok(Ok(())) => {}
        }

        tracing::info!("Controller stopped");
        Ok(())
    }
}
