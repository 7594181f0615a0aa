use std::time::Duration;

use storyforge_core::config::Config;

/// Engine tunables resolved from the `engine` config section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub classifier_temperature: f64,
    pub history_window: usize,
    pub max_follow_ups: usize,
    pub event_buffer: usize,
    pub max_steps: usize,
    /// Bound on one backend answer, and on the gap between streamed chunks.
    pub request_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.default_model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            classifier_temperature: config.classifier_temperature(),
            history_window: config.history_window(),
            max_follow_ups: config.max_follow_ups(),
            event_buffer: config.event_buffer(),
            max_steps: config.max_steps(),
            request_timeout: config.request_timeout(),
        }
    }
}
