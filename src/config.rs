use crate::{model::SamplingParams, normalizer::DEFAULT_MAX_DIMENSION};
use std::time::Duration;

/// Default upper bound on a single generation, queueing included.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default request body limit; base64 screenshots are large.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 50 * 1024 * 1024;

/// Runtime settings of the analysis service.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    /// Largest width or height handed to the model.
    pub max_dimension: u32,
    /// `None` waits for the worker indefinitely.
    pub generation_timeout: Option<Duration>,
    pub sampling: SamplingParams,
    pub max_request_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            generation_timeout: Some(DEFAULT_GENERATION_TIMEOUT),
            sampling: SamplingParams::default(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl ServiceConfig {
    /// Sets the generation timeout in whole seconds; zero disables it.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.generation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_dimension, 1024);
        assert_eq!(config.generation_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.sampling.max_new_tokens, 64);
        assert_eq!(config.sampling.num_beams, 1);
        assert!(config.sampling.do_sample);
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = ServiceConfig::default().with_timeout_secs(0);
        assert_eq!(config.generation_timeout, None);
        let config = config.with_timeout_secs(5);
        assert_eq!(config.generation_timeout, Some(Duration::from_secs(5)));
    }
}
