//! Soft-delete integrity nanny for the compute, storage and share databases.

use crate::classify::integrity;
use crate::driver::{IterationContext, Nanny, Observation};
use crate::error::{NannyError, Result};
use crate::repair::Upstream;
use crate::snapshot::IntegritySource;
use crate::tables::{pairs_for, IntegrityPair};
use async_trait::async_trait;
use std::sync::Arc;

pub struct IntegrityNanny {
    sources: Vec<Arc<dyn IntegritySource>>,
}

impl IntegrityNanny {
    pub fn new(sources: Vec<Arc<dyn IntegritySource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl Nanny for IntegrityNanny {
    fn name(&self) -> &str {
        "integrity"
    }

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation> {
        let mut obs = Observation::default();
        let mut last_error = None;

        for source in &self.sources {
            let database = source.database();
            let upstream = Upstream::for_database(database).as_str();
            let pairs: Vec<IntegrityPair> = pairs_for(database).copied().collect();
            match source.integrity_snapshot(&pairs).await {
                Ok(snapshot) => {
                    let faults = integrity::classify(&snapshot);
                    tracing::debug!(
                        "integrity cycle {}: {} faults in {}",
                        ctx.cycle,
                        faults.len(),
                        database
                    );
                    obs.faults.extend(faults);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("{} integrity scan unavailable: {}", upstream, e);
                    obs.unavailable.push(upstream.to_string());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if !self.sources.is_empty() && obs.unavailable.len() == self.sources.len() {
            return Err(last_error.unwrap_or_else(|| {
                NannyError::unavailable("integrity", "no database reachable")
            }));
        }
        Ok(obs)
    }
}
