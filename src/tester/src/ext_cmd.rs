//! The test-module registry. Grounded on `ovn_tester.py:266-284`
//! (`RESERVED`, `configure_tests`): every non-reserved top-level YAML
//! section names a test module, loaded there via `importlib`. A Rust
//! binary can't discover modules by name at runtime, so the registry is a
//! static dispatch table instead.

use std::collections::HashMap;

use async_trait::async_trait;
use oh_util::error::Error;
use oh_workload::Cluster;
use serde_yaml::Value;

use crate::config::GlobalCfg;

/// One scale/performance scenario, run after the base cluster bring-up.
/// The base class name in the original (`ovn_ext_cmd.ExtCmd`) is kept as
/// the trait name since nothing here is specific to any one scenario.
#[async_trait]
pub trait ExtCmd: Send + Sync {
    async fn run(&self, ovn: &mut Cluster, global_cfg: &GlobalCfg) -> Result<(), Error>;
}

type Constructor = fn(&Value) -> Box<dyn ExtCmd>;

/// Maps a YAML section name to its test constructor, replacing
/// `importlib.import_module(f'tests.{section}')` +
/// `getattr(mod, class_name)`'s dynamic module/class lookup.
pub fn registry() -> HashMap<&'static str, Constructor> {
    let mut map: HashMap<&'static str, Constructor> = HashMap::new();
    map.insert("netpol_cross_ns", |config| Box::new(crate::tests::netpol_cross_ns::NetpolCrossNs::from_config(config)));
    map
}

/// Builds one `ExtCmd` per non-reserved top-level section present in
/// `config`, in the order registered, matching `configure_tests`.
pub fn configure_tests(config: &Value) -> Vec<Box<dyn ExtCmd>> {
    let registry = registry();
    let mapping = match config.as_mapping() {
        Some(m) => m,
        None => return Vec::new(),
    };
    let mut tests = Vec::new();
    for (key, _) in mapping {
        let section = match key.as_str() {
            Some(s) => s,
            None => continue,
        };
        if crate::config::RESERVED.contains(&section) {
            continue;
        }
        if let Some(ctor) = registry.get(section) {
            tests.push(ctor(config));
        } else {
            tracing::warn!(section, "no test module registered for this section, skipping");
        }
    }
    tests
}
