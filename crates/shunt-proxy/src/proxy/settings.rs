//! Settings of a proxy instance that can change while it runs.

use super::context::ExchangeSettings;
use crate::config::ProxySettings;
use crate::middleware::Measurements;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Change to the limit of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum SpeedLimit {
    /// Leave the current limit in place
    #[default]
    Keep,
    /// Remove the limit
    Unlimited,
    /// Limit to this many kb/s; 0 stalls the transfer
    Rate(f64),
}

impl SpeedLimit {
    fn apply(self, current: &mut Option<f64>) {
        match self {
            SpeedLimit::Keep => {}
            SpeedLimit::Unlimited => *current = None,
            SpeedLimit::Rate(rate) => *current = Some(rate),
        }
    }
}

/// Speed limit change, in kb/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedSetting {
    /// Same limit for uploads and downloads
    Both(f64),
    Directions {
        request: SpeedLimit,
        response: SpeedLimit,
    },
}

impl From<f64> for SpeedSetting {
    fn from(rate: f64) -> Self {
        SpeedSetting::Both(rate)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Speeds {
    request: Option<f64>,
    response: Option<f64>,
}

/// Mutable settings shared by a proxy handle and its connection tasks.
#[derive(Debug, Default)]
pub struct LiveSettings {
    speeds: RwLock<Speeds>,
    use_cache: AtomicBool,
    reconnect: u32,
    measurements: Measurements,
}

impl LiveSettings {
    pub fn new(settings: &ProxySettings, use_cache: bool) -> Self {
        Self {
            speeds: RwLock::new(Speeds {
                request: settings.effective_request_speed(),
                response: settings.effective_response_speed(),
            }),
            use_cache: AtomicBool::new(use_cache),
            reconnect: settings.reconnect,
            measurements: Measurements::default(),
        }
    }

    pub fn set_speed(&self, speed: SpeedSetting) {
        let mut speeds = self.speeds.write();
        match speed {
            SpeedSetting::Both(rate) => {
                speeds.request = Some(rate);
                speeds.response = Some(rate);
            }
            SpeedSetting::Directions { request, response } => {
                request.apply(&mut speeds.request);
                response.apply(&mut speeds.response);
            }
        }
    }

    pub fn reset_speed(&self) {
        *self.speeds.write() = Speeds::default();
    }

    pub fn request_speed(&self) -> Option<f64> {
        self.speeds.read().request
    }

    pub fn response_speed(&self) -> Option<f64> {
        self.speeds.read().response
    }

    pub fn set_use_cache(&self, enabled: bool) {
        self.use_cache.store(enabled, Ordering::Release);
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Acquire)
    }

    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    /// Values for an exchange starting now.
    pub fn snapshot(&self) -> ExchangeSettings {
        let speeds = *self.speeds.read();
        ExchangeSettings {
            request_speed: speeds.request,
            response_speed: speeds.response,
            use_cache: self.use_cache(),
            reconnect: self.reconnect,
        }
    }
}
