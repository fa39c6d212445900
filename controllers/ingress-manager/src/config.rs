//! Controller configuration.
//!
//! Everything is read from environment variables; unset variables fall back
//! to the defaults below. Unparsable values fail startup.

use crate::error::ControllerError;
use crate::reconciler::IngressTemplate;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use workqueue::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, ItemFibonacciRateLimiter, MAX_DELAY,
    MaxOfRateLimiter, RateLimiter,
};

/// Default number of worker tasks
pub const DEFAULT_WORKERS: usize = 5;

/// Default retry ceiling per key
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default annotation that requests an Ingress for a Service
pub const DEFAULT_INTENT_ANNOTATION: &str = "ingress/http";

/// Shape of the per-key retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// `base * 2^failures`
    #[default]
    Exponential,
    /// base, base, 2*base, 3*base, 5*base, ...
    Fibonacci,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(format!("unknown backoff kind {other:?}")),
        }
    }
}

/// Runtime configuration for the Ingress Manager Controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    /// Explicit kubeconfig file, `None` for in-cluster / default resolution
    pub kubeconfig_path: Option<String>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Retries per key before it is dropped
    pub max_retries: u32,
    /// Per-key backoff curve
    pub backoff_kind: BackoffKind,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_max: Duration,
    /// Overall retry rate
    pub rate_limit_qps: f64,
    /// Overall retry burst
    pub rate_limit_burst: u32,
    /// Deadline for each create/delete call
    pub api_timeout: Duration,
    /// Annotation whose presence requests an Ingress
    pub intent_annotation: String,
    /// Shape of the Ingress created for each Service
    pub ingress: IngressTemplate,
    /// Listen address for `/metrics`, `/healthz` and `/readyz`
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kubeconfig_path: None,
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_kind: BackoffKind::Exponential,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            rate_limit_qps: 10.0,
            rate_limit_burst: 100,
            api_timeout: Duration::from_secs(30),
            intent_annotation: DEFAULT_INTENT_ANNOTATION.to_string(),
            ingress: IngressTemplate::default(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let workers = parse(&lookup, "WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKERS must be at least 1".to_string(),
            ));
        }

        let backoff_base = Duration::from_millis(parse(&lookup, "BACKOFF_BASE_MS", 5)?);
        let backoff_max = Duration::from_secs(parse(&lookup, "BACKOFF_MAX_SECS", 1000)?);
        if backoff_max > MAX_DELAY {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECS must not exceed {}",
                MAX_DELAY.as_secs()
            )));
        }
        if backoff_base > backoff_max {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_BASE_MS must not exceed BACKOFF_MAX_SECS".to_string(),
            ));
        }

        let rate_limit_qps: f64 = parse(&lookup, "RATE_LIMIT_QPS", defaults.rate_limit_qps)?;
        if !rate_limit_qps.is_finite() || rate_limit_qps <= 0.0 {
            return Err(ControllerError::InvalidConfig(format!(
                "RATE_LIMIT_QPS must be a positive number, got {rate_limit_qps}"
            )));
        }

        Ok(Self {
            namespace: non_empty("WATCH_NAMESPACE"),
            kubeconfig_path: non_empty("KUBECONFIG_PATH"),
            workers,
            max_retries: parse(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            backoff_kind: parse(&lookup, "BACKOFF_KIND", defaults.backoff_kind)?,
            backoff_base,
            backoff_max,
            rate_limit_qps,
            rate_limit_burst: parse(&lookup, "RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            api_timeout: Duration::from_secs(parse(&lookup, "API_TIMEOUT_SECS", 30)?),
            intent_annotation: non_empty("INTENT_ANNOTATION")
                .unwrap_or(defaults.intent_annotation),
            ingress: IngressTemplate {
                host: non_empty("INGRESS_HOST").unwrap_or(defaults.ingress.host),
                class_name: non_empty("INGRESS_CLASS").unwrap_or(defaults.ingress.class_name),
                backend_port: parse(&lookup, "BACKEND_PORT", defaults.ingress.backend_port)?,
            },
            metrics_addr: parse(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
        })
    }

    /// Builds the retry backoff curve described by this configuration.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<String> {
        let per_key: Box<dyn RateLimiter<String>> = match self.backoff_kind {
            BackoffKind::Exponential => Box::new(ItemExponentialFailureRateLimiter::new(
                self.backoff_base,
                self.backoff_max,
            )),
            BackoffKind::Fibonacci => Box::new(ItemFibonacciRateLimiter::new(
                self.backoff_base,
                self.backoff_max,
            )),
        };
        MaxOfRateLimiter::new(vec![
            per_key,
            Box::new(BucketRateLimiter::new(
                self.rate_limit_qps,
                self.rate_limit_burst,
            )),
        ])
    }
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{name}={raw:?} is invalid: {e}"))
        }),
        _ => Ok(default),
    }
}
