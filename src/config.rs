use serde::Deserialize;

use crate::params::{DEFAULT_ENERGY_LIMIT, MAX_REENTRANT_DEPTH};
use crate::persist::fee::FeeSchedule;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Consult and update the execution cache. When off, every call reads the kernel.
    pub cache_enabled: bool,
    /// Energy available to the graph traffic of one transaction.
    pub energy_limit: u64,
    pub fees: FeeSchedule,
    pub max_reentrant_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            energy_limit: DEFAULT_ENERGY_LIMIT,
            fees: FeeSchedule::default(),
            max_reentrant_depth: MAX_REENTRANT_DEPTH,
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[test]
fn test_config_from_json() {
    let c = ExecutorConfig::from_json(
        r#"{"cacheEnabled": false, "energyLimit": 100, "fees": {"heapByte": 4}}"#,
    )
    .unwrap();
    assert!(!c.cache_enabled);
    assert_eq!(c.energy_limit, 100);
    assert_eq!(c.fees.heap_byte, 4);
    assert_eq!(c.fees.heap_base, FeeSchedule::default().heap_base);
    assert_eq!(c.max_reentrant_depth, MAX_REENTRANT_DEPTH);
    assert_eq!(ExecutorConfig::from_json("{}").unwrap(), ExecutorConfig::default());
}
