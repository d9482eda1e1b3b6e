// Copyright 2020-2026 Simserve developers.
// This file is part of Simserve.

// Simserve is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Simserve is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Simserve.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;

use crate::Error;

/// Option key for the milliseconds without progress before the peer is
/// declared down.
pub const MAX_RETRY_PROPERTY: &str = "max.retry";
/// Option key for the sleep between reconnection attempts.
pub const RETRY_WAIT_PROPERTY: &str = "retry.wait";
/// Option key for the capacity of the pending queue.
pub const QUEUE_SIZE_PROPERTY: &str = "queue.size";
/// Option key for the capacity of the sent window.
pub const SENT_QUEUE_SIZE_PROPERTY: &str = "sent.queue.size";

/// Request queue client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Milliseconds without an acknowledgment before the peer is
    /// declared down.
    pub max_retry: u64,
    /// Milliseconds to sleep between reconnection attempts.
    pub retry_wait: u64,
    /// Maximum number of requests awaiting transmission.
    pub queue_size: usize,
    /// Maximum number of requests shipped but not yet acknowledged.
    /// Must be at least `queue_size`.
    pub sent_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_retry: 15_000,
            retry_wait: 200,
            queue_size: 100,
            sent_queue_size: 100,
        }
    }
}

impl Config {
    /// Builds a configuration from the recognized string options,
    /// falling back to defaults for absent keys. Invalid values are
    /// rejected with a descriptive error.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Config, Error> {
        let mut config = Config::default();
        if let Some(value) = options.get(MAX_RETRY_PROPERTY) {
            config.max_retry = parse_option(MAX_RETRY_PROPERTY, value)?;
        }
        if let Some(value) = options.get(RETRY_WAIT_PROPERTY) {
            config.retry_wait = parse_option(RETRY_WAIT_PROPERTY, value)?;
        }
        if let Some(value) = options.get(QUEUE_SIZE_PROPERTY) {
            config.queue_size = parse_option(QUEUE_SIZE_PROPERTY, value)? as usize;
        }
        if let Some(value) = options.get(SENT_QUEUE_SIZE_PROPERTY) {
            config.sent_queue_size = parse_option(SENT_QUEUE_SIZE_PROPERTY, value)? as usize;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the value constraints: every setting is at least 1 and the
    /// sent window is no smaller than the pending queue.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_retry < 1 {
            return Err(Error::Config(format!(
                "{MAX_RETRY_PROPERTY} must be at least 1"
            )));
        }
        if self.retry_wait < 1 {
            return Err(Error::Config(format!(
                "{RETRY_WAIT_PROPERTY} must be at least 1"
            )));
        }
        if self.queue_size < 1 {
            return Err(Error::Config(format!(
                "{QUEUE_SIZE_PROPERTY} must be at least 1"
            )));
        }
        if self.sent_queue_size < self.queue_size {
            return Err(Error::Config(format!(
                "{SENT_QUEUE_SIZE_PROPERTY} must be at least {QUEUE_SIZE_PROPERTY}"
            )));
        }
        Ok(())
    }
}

fn parse_option(key: &str, value: &str) -> Result<u64, Error> {
    match value.parse::<u64>() {
        Ok(parsed) if parsed >= 1 => Ok(parsed),
        _ => Err(Error::Config(format!("invalid value for {key}: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn options_override_defaults() {
        let config = Config::from_options(&options(&[
            ("max.retry", "5000"),
            ("retry.wait", "50"),
            ("queue.size", "10"),
            ("sent.queue.size", "20"),
        ]))
        .unwrap();
        assert_eq!(config.max_retry, 5000);
        assert_eq!(config.retry_wait, 50);
        assert_eq!(config.queue_size, 10);
        assert_eq!(config.sent_queue_size, 20);
    }

    #[test]
    fn zero_and_garbage_values_are_rejected() {
        assert_matches!(
            Config::from_options(&options(&[("queue.size", "0")])),
            Err(Error::Config(_))
        );
        assert_matches!(
            Config::from_options(&options(&[("max.retry", "soon")])),
            Err(Error::Config(_))
        );
        assert_matches!(
            Config::from_options(&options(&[("retry.wait", "-1")])),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn sent_window_must_cover_pending_queue() {
        assert_matches!(
            Config::from_options(&options(&[
                ("queue.size", "50"),
                ("sent.queue.size", "10"),
            ])),
            Err(Error::Config(_))
        );
    }
}
