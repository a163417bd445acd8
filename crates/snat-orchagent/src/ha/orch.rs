//! NAPT HA orchestration logic.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use snat_orch_common::TaskError;
use snat_types::{RouterId, SwitchId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::{AllocatorError, ExternalIpAllocator};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::{ContextError, ContextResolver};
use crate::flows::{FlowOrch, FlowOrchError, RouterFlowContext};
use crate::selector::NaptSwitchSelector;
use crate::services::{SwitchLiveness, TopologyService};
use crate::session::{NaptSessionManager, SessionError};
use crate::store::{NatStore, RouterState, StaleCleanup, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NaptHaError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("Newly elected switch {switch} for router {router} is not reachable")]
    NewPrimaryUnreachable { router: RouterId, switch: SwitchId },

    #[error("Switch {0} has no tunnel endpoint")]
    NoTunnelEndpoint(SwitchId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Flow(#[from] FlowOrchError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}

pub type Result<T> = std::result::Result<T, NaptHaError>;

impl From<NaptHaError> for TaskError {
    fn from(err: NaptHaError) -> Self {
        match err {
            NaptHaError::RouterNotFound(_) | NaptHaError::NoTunnelEndpoint(_) => {
                TaskError::invalid_config(err.to_string())
            }
            // Never point a router at an unverified switch; wait for SwitchUp.
            NaptHaError::NewPrimaryUnreachable { .. } => TaskError::aborted(err.to_string()),
            NaptHaError::Store(e) => e.into(),
            NaptHaError::Context(e) => e.into(),
            NaptHaError::Flow(e) => e.into(),
            NaptHaError::Session(e) => e.into(),
            NaptHaError::Allocator(e) => e.into(),
        }
    }
}

/// What to tear down when no switch can take over a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoSwitchAction {
    #[default]
    WithdrawRoutes,
    WithdrawRoutesAndFib,
}

#[derive(Debug, Clone, Default)]
pub struct NaptHaConfig {
    pub no_switch_action: NoSwitchAction,
}

impl NaptHaConfig {
    pub fn with_no_switch_action(mut self, action: NoSwitchAction) -> Self {
        self.no_switch_action = action;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: Option<SwitchId>,
    pub to: SwitchId,
    pub ordinary_updated: usize,
    pub sessions_replayed: usize,
    pub routes_advertised: usize,
    /// Old primary could not be cleaned; retried on its SwitchUp.
    pub cleanup_deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The down switch was not serving the router.
    NotPrimary,
    /// No switch left to elect; the router is unassigned.
    Unassigned,
    Migrated(MigrationReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NaptHaStats {
    pub migrations: u64,
    pub unassigned: u64,
    pub aborted: u64,
    pub deferred_cleanups: u64,
}

#[derive(Default)]
struct Counters {
    migrations: AtomicU64,
    unassigned: AtomicU64,
    aborted: AtomicU64,
    deferred_cleanups: AtomicU64,
}

pub struct NaptHaOrch {
    config: NaptHaConfig,
    store: Arc<dyn NatStore>,
    liveness: Arc<dyn SwitchLiveness>,
    topology: Arc<dyn TopologyService>,
    selector: Arc<dyn NaptSwitchSelector>,
    flow_orch: Arc<FlowOrch>,
    sessions: Arc<NaptSessionManager>,
    allocator: Arc<ExternalIpAllocator>,
    resolver: Arc<ContextResolver>,
    counters: Counters,
}

impl NaptHaOrch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NaptHaConfig,
        store: Arc<dyn NatStore>,
        liveness: Arc<dyn SwitchLiveness>,
        topology: Arc<dyn TopologyService>,
        selector: Arc<dyn NaptSwitchSelector>,
        flow_orch: Arc<FlowOrch>,
        sessions: Arc<NaptSessionManager>,
        allocator: Arc<ExternalIpAllocator>,
        resolver: Arc<ContextResolver>,
    ) -> Self {
        Self {
            config,
            store,
            liveness,
            topology,
            selector,
            flow_orch,
            sessions,
            allocator,
            resolver,
            counters: Counters::default(),
        }
    }

    pub fn selector(&self) -> &Arc<dyn NaptSwitchSelector> {
        &self.selector
    }

    pub fn stats(&self) -> NaptHaStats {
        NaptHaStats {
            migrations: self.counters.migrations.load(Ordering::Relaxed),
            unassigned: self.counters.unassigned.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            deferred_cleanups: self.counters.deferred_cleanups.load(Ordering::Relaxed),
        }
    }

    /// Handles `down` becoming unreachable for `router`.
    ///
    /// A router already in `Migrating` resumes its failover even though the
    /// assignment may already point at the new switch, so a retried job
    /// finishes what a failed attempt started.
    pub async fn on_switch_down(&self, router: &RouterId, down: SwitchId) -> Result<FailoverOutcome> {
        let record = self
            .store
            .router(router)
            .ok_or_else(|| NaptHaError::RouterNotFound(router.clone()))?;
        let is_primary = self.store.napt_switch(router) == Some(down);
        let resuming = record.state == RouterState::Migrating;
        if !is_primary && !resuming {
            debug!(
                "NaptHaOrch: switch {} is not the NAPT switch of router {}",
                down, router
            );
            return Ok(FailoverOutcome::NotPrimary);
        }

        self.store.set_router_state(router, RouterState::Migrating)?;
        info!(
            "NaptHaOrch: NAPT switch {} of router {} is down, re-electing",
            down, router
        );
        audit_log!(AuditRecord::new(
            AuditCategory::NaptFailover,
            "NaptHaOrch",
            "switch_down"
        )
        .with_outcome(AuditOutcome::InProgress)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({ "down": down.as_u64(), "resuming": resuming && !is_primary })));

        let candidates = self.topology.candidate_switches(router);
        let exclude = BTreeSet::from([down]);

        match self.selector.select(&candidates, &exclude) {
            None => self.leave_unassigned(router, down).await,
            Some(to) if !self.liveness.is_switch_up(to) => {
                let withdrawn = self.withdraw_unserved(router).await?;
                self.defer_primary_cleanup(router, down)?;
                self.store.set_assignment(router, None);
                self.store.set_router_state(router, RouterState::PendingElection)?;
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);

                let err = NaptHaError::NewPrimaryUnreachable {
                    router: router.clone(),
                    switch: to,
                };
                error!("NaptHaOrch: {}", err);
                audit_log!(AuditRecord::new(
                    AuditCategory::NaptFailover,
                    "NaptHaOrch",
                    "migrate"
                )
                .with_outcome(AuditOutcome::Failure)
                .with_object_id(router.to_string())
                .with_object_type("router")
                .with_details(serde_json::json!({
                    "from": down.as_u64(),
                    "to": to.as_u64(),
                    "routes_withdrawn": withdrawn,
                }))
                .with_error(err.to_string()));
                Err(err)
            }
            Some(to) => {
                let report = self.migrate(router, Some(down), to).await?;
                Ok(FailoverOutcome::Migrated(report))
            }
        }
    }

    /// Withdraws the routes of a router no switch serves, per
    /// `no_switch_action`. Labels and mappings stay.
    async fn withdraw_unserved(&self, router: &RouterId) -> Result<usize> {
        let remove_fib = self.config.no_switch_action == NoSwitchAction::WithdrawRoutesAndFib;
        Ok(self
            .allocator
            .withdraw_advertisements(router, remove_fib)
            .await?)
    }

    async fn leave_unassigned(&self, router: &RouterId, down: SwitchId) -> Result<FailoverOutcome> {
        let withdrawn = self.withdraw_unserved(router).await?;
        let remove_fib = self.config.no_switch_action == NoSwitchAction::WithdrawRoutesAndFib;
        self.defer_primary_cleanup(router, down)?;
        self.store.set_assignment(router, None);
        self.store.set_router_state(router, RouterState::PendingElection)?;
        self.counters.unassigned.fetch_add(1, Ordering::Relaxed);

        warn!(
            "NaptHaOrch: no switch available for router {}, left unassigned ({} routes withdrawn)",
            router, withdrawn
        );
        audit_log!(AuditRecord::new(
            AuditCategory::NaptFailover,
            "NaptHaOrch",
            "migrate"
        )
        .with_outcome(AuditOutcome::Failure)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "from": down.as_u64(),
            "routes_withdrawn": withdrawn,
            "fib_removed": remove_fib,
        }))
        .with_error("no candidate switch available"));
        Ok(FailoverOutcome::Unassigned)
    }

    /// An unreachable switch cannot be cleaned now; remember its keys for
    /// SwitchUp.
    pub fn defer_cleanup(&self, cleanup: StaleCleanup) {
        debug!(
            "NaptHaOrch: deferring cleanup of router {} on switch {} ({} flows, {} groups)",
            cleanup.router,
            cleanup.switch,
            cleanup.flows.len(),
            cleanup.groups.len()
        );
        self.store.add_stale_cleanup(cleanup);
        self.counters.deferred_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    fn defer_primary_cleanup(&self, router: &RouterId, switch: SwitchId) -> Result<()> {
        let ctx = self.resolver.resolve(router)?;
        let sessions = self.store.sessions(router);
        self.defer_cleanup(FlowOrch::primary_cleanup(switch, &ctx, &sessions));
        Ok(())
    }

    /// Makes `to` the NAPT switch of `router`, moving it off `from`.
    ///
    /// Also used for first elections (`from == None`). Safe to re-run for
    /// the same target.
    pub async fn migrate(
        &self,
        router: &RouterId,
        from: Option<SwitchId>,
        to: SwitchId,
    ) -> Result<MigrationReport> {
        let ctx = self.resolver.resolve(router)?;
        self.store.set_assignment(router, Some(to));
        self.flow_orch.install_primary(to, &ctx).await?;

        let mut ordinary_updated = 0;
        for switch in self.topology.candidate_switches(router) {
            if switch == to || Some(switch) == from {
                continue;
            }
            if !self.liveness.is_switch_up(switch) {
                debug!(
                    "NaptHaOrch: skipping down switch {} for router {}",
                    switch, router
                );
                continue;
            }
            self.flow_orch.install_ordinary(switch, to, &ctx).await?;
            ordinary_updated += 1;
        }

        let sessions_replayed = self.sessions.replay(router, to, &ctx).await?;

        let next_hop = self
            .topology
            .switch_endpoint(to)
            .ok_or(NaptHaError::NoTunnelEndpoint(to))?;
        let routes_advertised = self
            .allocator
            .refresh_advertisements(router, next_hop)
            .await?;

        self.flow_orch.remove_stale_group(to, &ctx).await?;

        let cleanup_deferred = match from {
            Some(old) if old != to => !self.release_primary(router, old, &ctx).await,
            _ => false,
        };

        self.store.set_router_state(router, RouterState::Active)?;
        self.counters.migrations.fetch_add(1, Ordering::Relaxed);

        let report = MigrationReport {
            from,
            to,
            ordinary_updated,
            sessions_replayed,
            routes_advertised,
            cleanup_deferred,
        };
        info!(
            "NaptHaOrch: router {} now served by switch {} (from {:?}, {} sessions replayed)",
            router, to, from, sessions_replayed
        );
        audit_log!(AuditRecord::new(
            if from.is_some() {
                AuditCategory::NaptFailover
            } else {
                AuditCategory::NaptElection
            },
            "NaptHaOrch",
            "migrate"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "from": from.map(|s| s.as_u64()),
            "to": to.as_u64(),
            "ordinary_updated": ordinary_updated,
            "sessions_replayed": sessions_replayed,
            "routes_advertised": routes_advertised,
            "cleanup_deferred": cleanup_deferred,
        })));
        Ok(report)
    }

    /// Removes the primary-role state of `router` from `old`, session
    /// flows included. Best effort: returns false and records a stale
    /// cleanup on failure.
    pub async fn release_primary(&self, router: &RouterId, old: SwitchId, ctx: &RouterFlowContext) -> bool {
        let sessions = self.store.sessions(router);
        match self.flow_orch.remove_primary(old, ctx, &sessions).await {
            Ok(()) => {
                self.store.remove_stale_cleanup(old, router);
                true
            }
            Err(e) => {
                warn!(
                    "NaptHaOrch: cleanup of NAPT switch {} for router {} failed, deferring: {}",
                    old, router, e
                );
                self.defer_cleanup(FlowOrch::primary_cleanup(old, ctx, &sessions));
                false
            }
        }
    }

    /// Retries a deferred cleanup on `switch`. Works from the recorded
    /// keys, so it also runs after the router was removed. Returns false
    /// when nothing was pending.
    pub async fn retry_stale_cleanup(&self, router: &RouterId, switch: SwitchId) -> Result<bool> {
        let Some(cleanup) = self.store.stale_cleanup(switch, router) else {
            return Ok(false);
        };
        if self.store.napt_switch(router) == Some(switch) {
            // Re-elected before the cleanup ran; its state is current again.
            self.store.remove_stale_cleanup(switch, router);
            return Ok(false);
        }
        self.flow_orch.apply_cleanup(&cleanup).await?;
        self.store.remove_stale_cleanup(switch, router);
        info!(
            "NaptHaOrch: removed stale primary state of router {} from switch {}",
            router, switch
        );
        Ok(true)
    }

    /// Moves a router out of `Migrating` after its job gave up: `Active`
    /// if a switch is assigned, `PendingElection` otherwise.
    pub fn restore_stable_state(&self, router: &RouterId) -> Option<RouterState> {
        let record = self.store.router(router)?;
        if record.state.is_stable() {
            return Some(record.state);
        }
        let state = if self.store.napt_switch(router).is_some() {
            RouterState::Active
        } else {
            RouterState::PendingElection
        };
        if self.store.set_router_state(router, state).is_err() {
            return None;
        }
        warn!(
            "NaptHaOrch: router {} restored from {} to {}",
            router,
            RouterState::Migrating,
            state
        );
        Some(state)
    }
}
