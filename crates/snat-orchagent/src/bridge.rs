//! RouteBridge: labels, FIB entries and BGP advertisements of external IPs.
//!
//! Each advertisement is a fixed pipeline: generate label, install the FIB
//! entry, advertise, then record the label on the endpoint mappings. A failed
//! stage stops the pipeline and is reported with the stage that failed;
//! nothing already done is rolled back, but the label is only recorded once
//! the route is out, so a labelled mapping always means an advertised IP.

use log::{debug, info, warn};
use snat_orch_common::TaskError;
use snat_types::{Ipv4Prefix, Label, RouterId};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::services::{RouteService, ServiceError, VpnBinding};
use crate::store::NatStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertStage {
    Label,
    Fib,
    Advertise,
    Withdraw,
    ReleaseLabel,
}

impl fmt::Display for AdvertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdvertStage::Label => "label",
            AdvertStage::Fib => "fib",
            AdvertStage::Advertise => "advertise",
            AdvertStage::Withdraw => "withdraw",
            AdvertStage::ReleaseLabel => "release-label",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Route {stage} stage failed for {prefix}: {source}")]
pub struct BridgeError {
    pub stage: AdvertStage,
    pub prefix: Ipv4Prefix,
    #[source]
    pub source: ServiceError,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<BridgeError> for TaskError {
    fn from(err: BridgeError) -> Self {
        TaskError::southbound(err.to_string())
    }
}

fn stage(stage: AdvertStage, prefix: Ipv4Prefix) -> impl FnOnce(ServiceError) -> BridgeError {
    move |source| BridgeError {
        stage,
        prefix,
        source,
    }
}

pub struct RouteBridge {
    routes: Arc<dyn RouteService>,
    store: Arc<dyn NatStore>,
}

impl RouteBridge {
    pub fn new(routes: Arc<dyn RouteService>, store: Arc<dyn NatStore>) -> Self {
        Self { routes, store }
    }

    /// Generates a label for `ip`, installs and advertises the /32 via
    /// `next_hop`, then stores the label on every mapping of `router` onto
    /// `ip`.
    pub async fn request_and_advertise(
        &self,
        router: &RouterId,
        vpn: &VpnBinding,
        ip: Ipv4Addr,
        next_hop: Ipv4Addr,
    ) -> Result<Label> {
        let prefix = Ipv4Prefix::host(ip);
        let result = self.advertise_pipeline(router, vpn, prefix, next_hop).await;

        match &result {
            Ok(label) => {
                info!(
                    "RouteBridge: advertised {} in {} via {} with label {}",
                    prefix, vpn.name, next_hop, label
                );
                audit_log!(AuditRecord::new(
                    AuditCategory::RouteAdvertisement,
                    "RouteBridge",
                    "advertise"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(prefix.to_string())
                .with_object_type("external_ip")
                .with_details(serde_json::json!({
                    "router": router.as_str(),
                    "vpn": vpn.name,
                    "rd": vpn.route_distinguisher,
                    "next_hop": next_hop.to_string(),
                    "label": label.value(),
                })));
            }
            Err(e) => {
                warn!("RouteBridge: {} (router {})", e, router);
                audit_log!(AuditRecord::new(
                    AuditCategory::RouteAdvertisement,
                    "RouteBridge",
                    "advertise"
                )
                .with_outcome(AuditOutcome::Failure)
                .with_object_id(prefix.to_string())
                .with_object_type("external_ip")
                .with_details(serde_json::json!({
                    "router": router.as_str(),
                    "stage": e.stage.to_string(),
                }))
                .with_error(e.to_string()));
            }
        }
        result
    }

    async fn advertise_pipeline(
        &self,
        router: &RouterId,
        vpn: &VpnBinding,
        prefix: Ipv4Prefix,
        next_hop: Ipv4Addr,
    ) -> Result<Label> {
        let label = self
            .routes
            .generate_label(&vpn.name, &prefix)
            .await
            .map_err(stage(AdvertStage::Label, prefix))?;
        self.install_route(vpn, prefix, next_hop, label).await?;
        let updated = self
            .store
            .set_external_ip_label(router, prefix.network(), Some(label));
        debug!(
            "RouteBridge: label {} recorded on {} mappings of router {}",
            label, updated, router
        );
        Ok(label)
    }

    async fn install_route(
        &self,
        vpn: &VpnBinding,
        prefix: Ipv4Prefix,
        next_hop: Ipv4Addr,
        label: Label,
    ) -> Result<()> {
        let rd = &vpn.route_distinguisher;
        self.routes
            .add_fib_entry(rd, &prefix, next_hop, label)
            .await
            .map_err(stage(AdvertStage::Fib, prefix))?;
        self.routes
            .advertise(rd, &prefix, next_hop, label)
            .await
            .map_err(stage(AdvertStage::Advertise, prefix))
    }

    /// Re-publishes an already labelled IP, e.g. with a new next hop after
    /// failover.
    pub async fn readvertise(
        &self,
        vpn: &VpnBinding,
        ip: Ipv4Addr,
        label: Label,
        next_hop: Ipv4Addr,
    ) -> Result<()> {
        let prefix = Ipv4Prefix::host(ip);
        self.install_route(vpn, prefix, next_hop, label).await?;
        debug!(
            "RouteBridge: re-advertised {} in {} via {}",
            prefix, vpn.name, next_hop
        );
        Ok(())
    }

    /// Withdraws the route but keeps the label, so the IP can come back
    /// once a NAPT switch is available again.
    pub async fn withdraw_route(&self, vpn: &VpnBinding, ip: Ipv4Addr, remove_fib: bool) -> Result<()> {
        let prefix = Ipv4Prefix::host(ip);
        let rd = &vpn.route_distinguisher;
        self.routes
            .withdraw(rd, &prefix)
            .await
            .map_err(stage(AdvertStage::Withdraw, prefix))?;
        if remove_fib {
            self.routes
                .remove_fib_entry(rd, &prefix)
                .await
                .map_err(stage(AdvertStage::Fib, prefix))?;
        }
        info!(
            "RouteBridge: withdrew {} from {} (fib removed: {})",
            prefix, vpn.name, remove_fib
        );
        Ok(())
    }

    /// Full removal: FIB entry, advertisement and label. Safe to repeat.
    pub async fn withdraw(
        &self,
        router: &RouterId,
        vpn: &VpnBinding,
        ip: Ipv4Addr,
        label: Option<Label>,
    ) -> Result<()> {
        let prefix = Ipv4Prefix::host(ip);
        let rd = &vpn.route_distinguisher;
        self.routes
            .remove_fib_entry(rd, &prefix)
            .await
            .map_err(stage(AdvertStage::Fib, prefix))?;
        self.routes
            .withdraw(rd, &prefix)
            .await
            .map_err(stage(AdvertStage::Withdraw, prefix))?;
        self.routes
            .release_label(&vpn.name, &prefix)
            .await
            .map_err(stage(AdvertStage::ReleaseLabel, prefix))?;
        self.store.set_external_ip_label(router, ip, None);

        info!("RouteBridge: withdrew and released {} in {}", prefix, vpn.name);
        audit_log!(AuditRecord::new(
            AuditCategory::RouteAdvertisement,
            "RouteBridge",
            "withdraw"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(prefix.to_string())
        .with_object_type("external_ip")
        .with_details(serde_json::json!({
            "router": router.as_str(),
            "vpn": vpn.name,
            "label": label.map(|l| l.value()),
        })));
        Ok(())
    }
}
