//! NatDaemon implementation.
//!
//! The NatDaemon wires the SNAT components together and turns every
//! inbound event into jobs on the per-router queue:
//! - router events become one job for that router
//! - SwitchDown fans out to every router the switch was serving
//! - SwitchUp fans out to every enabled router and every router with
//!   stale state on the switch

use log::{debug, error, info, warn};
use snat_orch_common::{Job, JobOutcome, KeyedJobQueue, TaskError, TaskStatus};
use snat_types::{RouterId, SwitchId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::events::NatEvent;
use crate::allocator::ExternalIpAllocator;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::bridge::RouteBridge;
use crate::config::SnatOrchConfig;
use crate::context::ContextResolver;
use crate::flows::FlowOrch;
use crate::ha::NaptHaOrch;
use crate::router::RouterOrch;
use crate::selector::build_selector;
use crate::services::NatServices;
use crate::session::NaptSessionManager;
use crate::store::RouterState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub events: u64,
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
}

/// The SNAT control-plane daemon.
pub struct NatDaemon {
    config: SnatOrchConfig,
    services: NatServices,
    queue: KeyedJobQueue<RouterId>,
    flow_orch: Arc<FlowOrch>,
    allocator: Arc<ExternalIpAllocator>,
    sessions: Arc<NaptSessionManager>,
    ha: Arc<NaptHaOrch>,
    routers: Arc<RouterOrch>,
    counters: Counters,
}

impl NatDaemon {
    /// Builds every component on top of `services`.
    pub fn new(config: SnatOrchConfig, services: NatServices) -> Self {
        let store = services.store.clone();
        let resolver = Arc::new(ContextResolver::new(store.clone(), services.topology.clone()));
        let flow_orch = Arc::new(FlowOrch::new(
            config.flow_orch_config(),
            services.flows.clone(),
            services.tunnels.clone(),
        ));
        let bridge = Arc::new(RouteBridge::new(services.routes.clone(), store.clone()));
        let allocator = Arc::new(ExternalIpAllocator::new(
            store.clone(),
            services.topology.clone(),
            bridge,
            resolver.clone(),
        ));
        let sessions = Arc::new(NaptSessionManager::new(
            config.session_config(),
            store.clone(),
            services.id_pool.clone(),
            flow_orch.clone(),
            resolver.clone(),
        ));
        let selector = build_selector(config.election.strategy, store.clone());
        let ha = Arc::new(NaptHaOrch::new(
            config.ha_config(),
            store.clone(),
            services.liveness.clone(),
            services.topology.clone(),
            selector,
            flow_orch.clone(),
            sessions.clone(),
            allocator.clone(),
            resolver.clone(),
        ));
        let routers = Arc::new(RouterOrch::new(
            store,
            services.id_pool.clone(),
            services.liveness.clone(),
            services.topology.clone(),
            flow_orch.clone(),
            allocator.clone(),
            sessions.clone(),
            ha.clone(),
            resolver,
        ));
        let queue = KeyedJobQueue::new(config.job_queue_config());

        Self {
            config,
            services,
            queue,
            flow_orch,
            allocator,
            sessions,
            ha,
            routers,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SnatOrchConfig {
        &self.config
    }

    pub fn services(&self) -> &NatServices {
        &self.services
    }

    pub fn flow_orch(&self) -> &Arc<FlowOrch> {
        &self.flow_orch
    }

    pub fn allocator(&self) -> &Arc<ExternalIpAllocator> {
        &self.allocator
    }

    pub fn sessions(&self) -> &Arc<NaptSessionManager> {
        &self.sessions
    }

    pub fn ha(&self) -> &Arc<NaptHaOrch> {
        &self.ha
    }

    pub fn routers(&self) -> &Arc<RouterOrch> {
        &self.routers
    }

    pub fn stats(&self) -> DaemonStats {
        DaemonStats {
            events: self.counters.events.load(Ordering::Relaxed),
            jobs_submitted: self.counters.jobs_submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.jobs_failed.load(Ordering::Relaxed),
        }
    }

    pub fn start(&self) {
        info!(
            "NatDaemon: started ({} workers, {} retries, election {})",
            self.config.jobs.workers,
            self.config.jobs.max_retries,
            self.ha.selector().name()
        );
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "NatDaemon", "start")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "workers": self.config.jobs.workers,
                "max_retries": self.config.jobs.max_retries,
                "election": self.ha.selector().name(),
                "napt_mode": self.config.napt.mode,
            })));
    }

    /// Stops accepting work; jobs not yet started complete as failed.
    pub fn shutdown(&self) {
        self.queue.close();
        let stats = self.stats();
        info!(
            "NatDaemon: shut down after {} events ({} jobs, {} failed)",
            stats.events, stats.jobs_submitted, stats.jobs_failed
        );
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "NatDaemon", "shutdown")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "events": stats.events,
                "jobs_submitted": stats.jobs_submitted,
                "jobs_failed": stats.jobs_failed,
            })));
    }

    /// Queues the jobs for `event` and returns one receiver per job.
    pub fn dispatch(&self, event: NatEvent) -> Vec<oneshot::Receiver<JobOutcome>> {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        debug!("NatDaemon: dispatching {}", event);

        let receivers: Vec<_> = match event {
            NatEvent::RouterChanged { router: config } => {
                let key = config.id.clone();
                let routers = Arc::clone(&self.routers);
                vec![self.queue.submit(
                    key,
                    Job::new(move || {
                        let routers = Arc::clone(&routers);
                        let config = config.clone();
                        async move {
                            routers.on_router_changed(config).await?;
                            Ok::<(), TaskError>(())
                        }
                    }),
                )]
            }
            NatEvent::RouterRemoved { router } => {
                let routers = Arc::clone(&self.routers);
                let id = router.clone();
                vec![self.queue.submit(
                    router,
                    Job::new(move || {
                        let routers = Arc::clone(&routers);
                        let id = id.clone();
                        async move {
                            routers.on_router_removed(&id).await?;
                            Ok::<(), TaskError>(())
                        }
                    }),
                )]
            }
            NatEvent::SwitchDown { switch } => self
                .routers_served_by(switch)
                .into_iter()
                .map(|router| self.submit_failover(router, switch))
                .collect(),
            NatEvent::SwitchUp { switch } => self
                .routers_to_reconcile(switch)
                .into_iter()
                .map(|router| {
                    let routers = Arc::clone(&self.routers);
                    let id = router.clone();
                    self.queue.submit(
                        router,
                        Job::new(move || {
                            let routers = Arc::clone(&routers);
                            let id = id.clone();
                            async move {
                                routers.reconcile_switch_up(&id, switch).await?;
                                Ok::<(), TaskError>(())
                            }
                        }),
                    )
                })
                .collect(),
            NatEvent::VpnAssociationChanged {
                router,
                vpn,
                action,
            } => {
                let routers = Arc::clone(&self.routers);
                let id = router.clone();
                vec![self.queue.submit(
                    router,
                    Job::new(move || {
                        let routers = Arc::clone(&routers);
                        let id = id.clone();
                        async move {
                            routers.on_vpn_association_changed(&id, vpn, action).await?;
                            Ok::<(), TaskError>(())
                        }
                    }),
                )]
            }
            NatEvent::PacketIn { router, session } => {
                let sessions = Arc::clone(&self.sessions);
                let id = router.clone();
                vec![self.queue.submit(
                    router,
                    Job::new(move || {
                        let sessions = Arc::clone(&sessions);
                        let id = id.clone();
                        async move {
                            sessions.on_packet_in(&id, session).await?;
                            Ok::<(), TaskError>(())
                        }
                    }),
                )]
            }
            NatEvent::SessionExpired { router, session } => {
                let sessions = Arc::clone(&self.sessions);
                let id = router.clone();
                vec![self.queue.submit(
                    router,
                    Job::new(move || {
                        let sessions = Arc::clone(&sessions);
                        let id = id.clone();
                        async move {
                            sessions.on_session_expired(&id, session).await?;
                            Ok::<(), TaskError>(())
                        }
                    }),
                )]
            }
        };

        self.counters
            .jobs_submitted
            .fetch_add(receivers.len() as u64, Ordering::Relaxed);
        receivers
    }

    /// Failover job; a router left `Migrating` after the last attempt is
    /// restored to a stable state before its next job runs.
    fn submit_failover(&self, router: RouterId, switch: SwitchId) -> oneshot::Receiver<JobOutcome> {
        let ha = Arc::clone(&self.ha);
        let id = router.clone();
        let job = Job::new(move || {
            let ha = Arc::clone(&ha);
            let id = id.clone();
            async move {
                ha.on_switch_down(&id, switch).await?;
                Ok::<(), TaskError>(())
            }
        });

        let ha = Arc::clone(&self.ha);
        let id = router.clone();
        let recovery = Job::new(move || {
            let ha = Arc::clone(&ha);
            let id = id.clone();
            async move {
                ha.restore_stable_state(&id);
                Ok::<(), TaskError>(())
            }
        });
        self.queue.submit_with_recovery(router, job, recovery)
    }

    fn routers_served_by(&self, switch: SwitchId) -> Vec<RouterId> {
        self.services
            .store
            .assignments()
            .into_iter()
            .filter(|a| a.switch == Some(switch))
            .map(|a| a.router)
            .collect()
    }

    fn routers_to_reconcile(&self, switch: SwitchId) -> BTreeSet<RouterId> {
        let store = &self.services.store;
        let mut routers: BTreeSet<RouterId> = store
            .routers()
            .into_iter()
            .filter(|r| r.state != RouterState::Disabled)
            .map(|r| r.config.id)
            .collect();
        // Removed or disabled routers may still have state on the switch.
        routers.extend(store.stale_cleanups(switch).into_iter().map(|c| c.router));
        routers
    }

    /// Dispatches `event` and waits for every job it produced.
    pub async fn process(&self, event: NatEvent) -> Vec<JobOutcome> {
        let name = event.to_string();
        let receivers = self.dispatch(event);
        let mut outcomes = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let outcome = rx.await.unwrap_or_else(|_| JobOutcome {
                status: TaskStatus::Failed,
                attempts: 0,
                error: Some(TaskError::internal("job dropped before completion")),
            });
            self.record_outcome(&name, &outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn record_outcome(&self, event: &str, outcome: &JobOutcome) {
        if outcome.is_success() {
            self.counters.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
        let reason = outcome
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        if outcome.status.is_retryable() {
            warn!(
                "NatDaemon: {} gave up after {} attempts: {}",
                event, outcome.attempts, reason
            );
        } else {
            error!("NatDaemon: {} failed ({:?}): {}", event, outcome.status, reason);
        }
        audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "NatDaemon", "job_failed")
            .with_outcome(AuditOutcome::Failure)
            .with_details(serde_json::json!({
                "event": event,
                "attempts": outcome.attempts,
                "status": format!("{:?}", outcome.status),
            }))
            .with_error(reason));
    }
}
