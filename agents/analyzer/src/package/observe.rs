//! Package that launches nothing and monitors processes that already run.

use tracing::info;

use super::{AnalysisPackage, PackageContext, PackageError};

pub const NAME: &str = "observe";

pub fn load(ctx: &PackageContext) -> Result<AnalysisPackage, PackageError> {
    let pids = ctx.config.pids.clone();

    AnalysisPackage::builder(NAME)
        .on_start(move || {
            info!(pids = ?pids, "Observing running processes");
            Ok(pids.clone())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageConfig;
    use crate::gateway::TrackOnlyGateway;
    use std::sync::Arc;

    #[test]
    fn test_observe_returns_configured_pids() {
        let ctx = PackageContext {
            config: PackageConfig {
                name: NAME.to_string(),
                target: None,
                args: vec![],
                pids: vec![11, 12],
            },
            gateway: Arc::new(TrackOnlyGateway),
        };

        let mut package = load(&ctx).unwrap();

        assert_eq!(package.start().unwrap(), vec![11, 12]);
        assert!(!package.has_check());
        assert!(!package.has_finish());
    }
}
