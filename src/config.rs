use std::{net::SocketAddr, str::FromStr};

use crate::services::{abuse::AbuseSettings, smtp_mailer::SmtpSettings};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub bind_addr: SocketAddr,
    pub stripe: StripeSettings,
    pub webhook_tolerance_secs: i64,
    pub webhook_stale_processing_secs: i64,
    pub trial_duration_days: i64,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_bypass_paths: Vec<String>,
    pub trial_notification_interval_secs: u64,
    pub rate_limit_ms: u64,
    pub rate_limit_burst: u32,
    pub abuse: AbuseSettings,
    pub smtp: Option<SmtpSettings>,
    pub sentry_dsn: Option<String>,
    pub log_json: bool,
}

struct Lookup<F> {
    get: F,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.get)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn flag(&self, key: &'static str) -> bool {
        self.optional(key)
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup { get };
        let defaults = AbuseSettings::default();

        let abuse = AbuseSettings {
            cooldown_days: env.parsed("ABUSE_COOLDOWN_DAYS", defaults.cooldown_days)?,
            cooldown_points_per_account: env.parsed(
                "ABUSE_COOLDOWN_POINTS",
                defaults.cooldown_points_per_account,
            )?,
            cancellation_window_days: env.parsed(
                "ABUSE_CANCELLATION_WINDOW_DAYS",
                defaults.cancellation_window_days,
            )?,
            max_cancellations: env.parsed("ABUSE_MAX_CANCELLATIONS", defaults.max_cancellations)?,
            cancellation_points: env
                .parsed("ABUSE_CANCELLATION_POINTS", defaults.cancellation_points)?,
            max_trials_per_payment_method: env.parsed(
                "ABUSE_MAX_TRIALS_PER_PAYMENT_METHOD",
                defaults.max_trials_per_payment_method,
            )?,
            payment_reuse_points: env
                .parsed("ABUSE_PAYMENT_REUSE_POINTS", defaults.payment_reuse_points)?,
            max_reactivation_cycles: env.parsed(
                "ABUSE_MAX_REACTIVATION_CYCLES",
                defaults.max_reactivation_cycles,
            )?,
            cycle_points: env.parsed("ABUSE_CYCLE_POINTS", defaults.cycle_points)?,
            quick_subscribe_days: env
                .parsed("ABUSE_QUICK_SUBSCRIBE_DAYS", defaults.quick_subscribe_days)?,
            quick_cancel_days: env.parsed("ABUSE_QUICK_CANCEL_DAYS", defaults.quick_cancel_days)?,
            quick_pattern_points: env
                .parsed("ABUSE_QUICK_PATTERN_POINTS", defaults.quick_pattern_points)?,
            block_threshold: env.parsed("ABUSE_BLOCK_THRESHOLD", defaults.block_threshold)?,
            flag_threshold: env.parsed("ABUSE_FLAG_THRESHOLD", defaults.flag_threshold)?,
            warn_threshold: env.parsed("ABUSE_WARN_THRESHOLD", defaults.warn_threshold)?,
        };

        let smtp = match env.optional("SMTP_HOST") {
            None => None,
            Some(host) => Some(SmtpSettings {
                host,
                port: env.parsed("SMTP_PORT", 587u16)?,
                username: env.optional("SMTP_USERNAME"),
                password: env.optional("SMTP_PASSWORD"),
                from: env.required("SMTP_FROM")?,
                tls_disabled: env.flag("SMTP_TLS_DISABLED"),
            }),
        };

        let trial_duration_days: i64 = env.parsed("TRIAL_DURATION_DAYS", 7)?;
        if trial_duration_days < 1 {
            return Err(ConfigError::Invalid {
                key: "TRIAL_DURATION_DAYS",
                value: trial_duration_days.to_string(),
            });
        }

        Ok(Config {
            database_url: env.required("DATABASE_URL")?,
            frontend_origin: env.required("FRONTEND_ORIGIN")?,
            bind_addr: env.parsed("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            stripe: StripeSettings {
                secret_key: env.required("STRIPE_SECRET_KEY")?,
                webhook_secret: env.required("STRIPE_WEBHOOK_SECRET")?,
                price_id: env.required("STRIPE_PRICE_ID")?,
            },
            webhook_tolerance_secs: env.parsed("WEBHOOK_TOLERANCE_SECONDS", 300)?,
            webhook_stale_processing_secs: env.parsed("WEBHOOK_STALE_PROCESSING_SECONDS", 600)?,
            trial_duration_days,
            jwt_secret: env.required("JWT_SECRET")?,
            jwt_issuer: env
                .optional("JWT_ISSUER")
                .unwrap_or_else(|| "billing-gate".to_string()),
            jwt_audience: env
                .optional("JWT_AUDIENCE")
                .unwrap_or_else(|| "billing-gate-clients".to_string()),
            access_bypass_paths: env
                .optional("ACCESS_BYPASS_PATHS")
                .map(|raw| {
                    raw.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| p.starts_with('/'))
                        .collect()
                })
                .unwrap_or_default(),
            trial_notification_interval_secs: env
                .parsed("TRIAL_NOTIFICATION_INTERVAL_SECONDS", 3600)?,
            // Default: 200ms/token (~5 req/sec)
            rate_limit_ms: env.parsed("RATE_LIMITER_MILLISECONDS", 200)?,
            rate_limit_burst: env.parsed("RATE_LIMITER_BURST", 20)?,
            abuse,
            smtp,
            sentry_dsn: env.optional("SENTRY_DSN"),
            log_json: env
                .optional("LOG_FORMAT")
                .is_some_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }

    pub fn checkout_success_url(&self) -> String {
        format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.frontend_origin.trim_end_matches('/')
        )
    }

    pub fn checkout_cancel_url(&self) -> String {
        format!("{}/pricing", self.frontend_origin.trim_end_matches('/'))
    }

    pub fn billing_portal_return_url(&self) -> String {
        format!("{}/billing", self.frontend_origin.trim_end_matches('/'))
    }
}
