pub mod datalink;
pub mod synthetic;
pub mod tshark;

pub use datalink::{DatalinkMode, DatalinkStrategy};
pub use synthetic::SyntheticStrategy;
pub use tshark::{TsharkMode, TsharkStrategy};

use std::sync::Arc;
use crate::config::StrategyConfig;
use super::strategy::CaptureStrategy;

/// The strategy chain in the order the orchestrator tries it.
pub fn default_chain(settings: &StrategyConfig) -> Vec<Arc<dyn CaptureStrategy>> {
    let mut chain: Vec<Arc<dyn CaptureStrategy>> = Vec::new();
    if settings.enable_native {
        chain.push(Arc::new(DatalinkStrategy::stream()));
        chain.push(Arc::new(DatalinkStrategy::batch()));
    }
    if settings.enable_tshark {
        chain.push(Arc::new(TsharkStrategy::json(settings)));
        chain.push(Arc::new(TsharkStrategy::fields(settings)));
    }
    if settings.synthetic_fallback {
        chain.push(Arc::new(SyntheticStrategy::new(settings)));
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_order() {
        let names: Vec<String> = default_chain(&StrategyConfig::default())
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["datalink-stream", "datalink-batch", "tshark-json", "tshark-fields", "synthetic"]
        );
    }

    #[test]
    fn test_chain_respects_toggles() {
        let settings = StrategyConfig {
            enable_native: false,
            synthetic_fallback: false,
            ..StrategyConfig::default()
        };
        let names: Vec<String> = default_chain(&settings).iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["tshark-json", "tshark-fields"]);
    }
}
