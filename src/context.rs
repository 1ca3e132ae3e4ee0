use std::sync::Arc;

use crate::{
    clock::{Clock, SystemClock},
    codec::{EnvelopeCodec, JsonCodec},
    config::ClientConfig,
    directory::{Directory, IdentityProvider},
    freshness::FreshnessRegistry,
};

/// Everything a client needs beyond its session, passed explicitly instead of
/// living in process-wide globals.
#[derive(Clone)]
pub struct ClientContext {
    pub config: ClientConfig,
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn Directory>,
    pub identity: Arc<dyn IdentityProvider>,
    pub codec: Arc<dyn EnvelopeCodec>,
    pub freshness: Arc<FreshnessRegistry>,
}

impl ClientContext {
    /// System clock and JSON envelopes.
    pub fn new(
        config: ClientConfig,
        directory: Arc<dyn Directory>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemClock),
            directory,
            identity,
            Arc::new(JsonCodec),
        )
    }

    pub fn with_parts(
        config: ClientConfig,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn Directory>,
        identity: Arc<dyn IdentityProvider>,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        let freshness = Arc::new(FreshnessRegistry::new(config.query_cooldown));
        Self {
            config,
            clock,
            directory,
            identity,
            codec,
            freshness,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}
