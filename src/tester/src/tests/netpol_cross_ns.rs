//! Cross-namespace network-policy scale test. Grounded on
//! `tests/netpol_cross_ns.py`: a startup phase provisions `n_ns` namespaces
//! of `pods_ns_ratio` ports each under default-deny, a rate-governed phase
//! grants and verifies one cross-namespace allow rule per namespace per
//! iteration, and an optional cleanup phase tears every namespace down.

use std::sync::Arc;

use async_trait::async_trait;
use oh_stats::Context;
use oh_util::error::Error;
use oh_workload::{Cluster, Namespace};
use serde_yaml::Value;
use tokio::sync::Mutex;

use crate::config::GlobalCfg;
use crate::ext_cmd::ExtCmd;

pub struct NpCrossNsCfg {
    pub n_ns: usize,
    pub pods_ns_ratio: usize,
    pub queries_per_second: f64,
}

pub struct NetpolCrossNs {
    config: NpCrossNsCfg,
}

impl NetpolCrossNs {
    pub fn from_config(config: &Value) -> NetpolCrossNs {
        let empty = Value::Mapping(Default::default());
        let test_config = config.get("netpol_cross_ns").unwrap_or(&empty);
        NetpolCrossNs {
            config: NpCrossNsCfg {
                n_ns: test_config.get("n_ns").and_then(Value::as_u64).unwrap_or(0) as usize,
                pods_ns_ratio: test_config.get("pods_ns_ratio").and_then(Value::as_u64).unwrap_or(0) as usize,
                queries_per_second: test_config.get("queries_per_second").and_then(Value::as_f64).unwrap_or(20.0),
            },
        }
    }

    /// Locks `all_ns[a_idx]` and `all_ns[b_idx]` in ascending index order,
    /// so two iterations touching overlapping namespaces (as every
    /// adjacent pair here does) never wait on each other in opposite
    /// order and deadlock.
    async fn lock_pair<'a>(
        all_ns: &'a [Arc<Mutex<Namespace>>],
        a_idx: usize,
        b_idx: usize,
    ) -> (tokio::sync::MutexGuard<'a, Namespace>, tokio::sync::MutexGuard<'a, Namespace>) {
        if a_idx < b_idx {
            let a = all_ns[a_idx].lock().await;
            let b = all_ns[b_idx].lock().await;
            (a, b)
        } else {
            let b = all_ns[b_idx].lock().await;
            let a = all_ns[a_idx].lock().await;
            (a, b)
        }
    }
}

#[async_trait]
impl ExtCmd for NetpolCrossNs {
    async fn run(&self, ovn: &mut Cluster, global_cfg: &GlobalCfg) -> Result<(), Error> {
        let n_ns = self.config.n_ns;
        let mut all_ns: Vec<Arc<Mutex<Namespace>>> = Vec::with_capacity(n_ns);

        {
            let ctx = Context::new("netpol_cross_ns_startup", 1, true);
            let ports = ovn.provision_ports(self.config.pods_ns_ratio * n_ns, false).await?;
            for i in 0..n_ns {
                let mut ns = Namespace::create(ovn, &format!("NS_netpol_cross_ns_startup_{i}")).await?;
                let slice = ports[i * self.config.pods_ns_ratio..(i + 1) * self.config.pods_ns_ratio].to_vec();
                ns.add_ports(&ovn.nbctl, slice).await?;
                ns.default_deny(&ovn.nbctl).await?;
                all_ns.push(Arc::new(Mutex::new(ns)));
            }
            let (_, report) = ctx.finish();
            tracing::debug!(%report, "phase report");
        }

        // A cross-namespace pair needs at least two distinct namespaces;
        // with fewer, `(i + 1) % n_ns == i` would pair a namespace with
        // itself and there is nothing meaningful left to test.
        if n_ns >= 2 {
            let ctx = Context::new("netpol_cross_ns", n_ns, false);
            let nbctl = ovn.nbctl.clone();
            let cluster_snapshot = Arc::new(ovn.clone());
            let all_ns_for_qps = all_ns.clone();
            ctx.qps(self.config.queries_per_second, move |i| {
                let all_ns = all_ns_for_qps.clone();
                let nbctl = nbctl.clone();
                let cluster_snapshot = Arc::clone(&cluster_snapshot);
                async move {
                    let ext_idx = (i + 1) % n_ns;
                    let (mut ns, ext_ns) = Self::lock_pair(&all_ns, i, ext_idx).await;
                    ns.allow_cross_namespace(&nbctl, &ext_ns).await?;
                    ns.check_enforcing_cross_ns(&cluster_snapshot, &ext_ns).await
                }
            })
            .await?;
            let (_, report) = ctx.finish();
            tracing::debug!(%report, "phase report");
        }

        if !global_cfg.cleanup {
            return Ok(());
        }
        let ctx = Context::new("netpol_cross_ns_cleanup", 1, true);
        for ns in &all_ns {
            ns.lock().await.unprovision(ovn).await?;
        }
        let (_, report) = ctx.finish();
        tracing::debug!(%report, "phase report");
        Ok(())
    }
}
