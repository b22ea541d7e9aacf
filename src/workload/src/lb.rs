//! A thin handle over `oh_ovsdb::types::LoadBalancer` bundling the create
//! + VIP/backend mutation calls namespace and worker code issue together.
//! `ovn_load_balancer.py` is referenced throughout `ovn_workload.py`
//! (`create_load_balancer`, `add_vips`, `clear_vips`,
//! `add_backends_to_vip`, `add_to_switches`/`add_to_routers`) but was not
//! retrieved; this shape is reconstructed purely from those call sites.

use oh_ovsdb::nb::NbClient;
use oh_ovsdb::types::LoadBalancer;
use oh_util::error::Error;
use uuid::Uuid;

pub struct LoadBalancerHandle {
    pub inner: LoadBalancer,
}

impl LoadBalancerHandle {
    pub async fn create(name: &str, nbctl: &NbClient, vips: &[(String, String)]) -> Result<LoadBalancerHandle, Error> {
        let inner = nbctl.create_lb(name, "tcp").await?;
        if !vips.is_empty() {
            nbctl.lb_set_vips(&inner, vips).await?;
        }
        Ok(LoadBalancerHandle { inner })
    }

    pub async fn add_vips(&self, nbctl: &NbClient, vips: &[(String, String)]) -> Result<(), Error> {
        nbctl.lb_set_vips(&self.inner, vips).await
    }

    pub async fn clear_vips(&self, nbctl: &NbClient) -> Result<(), Error> {
        nbctl.lb_clear_vips(&self.inner).await
    }

    /// Adds `backend_ips` (already `ip:port`-formatted) as backends to
    /// every vip in `vips`, matching
    /// `load_balancer.add_backends_to_vip(port_ips, cluster_vips)`.
    pub async fn add_backends_to_vip(&self, nbctl: &NbClient, vips: &[String], backend_ips: &[String]) -> Result<(), Error> {
        let joined = backend_ips.join(",");
        let rows: Vec<(String, String)> = vips.iter().map(|v| (v.clone(), joined.clone())).collect();
        nbctl.lb_set_vips(&self.inner, &rows).await
    }

    pub async fn add_to_switches(&self, nbctl: &NbClient, switches: &[Uuid]) -> Result<(), Error> {
        nbctl.lb_add_to_switches(&self.inner, switches).await
    }

    pub async fn add_to_routers(&self, nbctl: &NbClient, routers: &[Uuid]) -> Result<(), Error> {
        nbctl.lb_add_to_routers(&self.inner, routers).await
    }

    pub async fn remove_from_switches(&self, nbctl: &NbClient, switches: &[Uuid]) -> Result<(), Error> {
        nbctl.lb_remove_from_switches(&self.inner, switches).await
    }

    pub async fn remove_from_routers(&self, nbctl: &NbClient, routers: &[Uuid]) -> Result<(), Error> {
        nbctl.lb_remove_from_routers(&self.inner, routers).await
    }
}
