use crate::clock::SchedulerConfig;
use crate::types::Role;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default listen port for the host endpoint
pub const DEFAULT_PORT: u16 = 6574;

/// Process configuration, read from `LASTCLICK_*` environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub role: Role,
    /// Unset means "resume the saved name, or make one up"
    pub display_name: Option<String>,
    pub bind: SocketAddr,
    /// WebSocket endpoint a guest dials, e.g. `ws://10.0.0.2:6574/ws`
    pub host_url: Option<String>,
    /// Room to join (guest) or resume (host)
    pub room_id: Option<String>,
    /// WAV file the host selects at startup
    pub stimulus: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let role = match non_empty("LASTCLICK_ROLE").as_deref() {
            Some("guest") => Role::Guest,
            Some("host") | None => Role::Host,
            Some(other) => {
                tracing::warn!("Unknown LASTCLICK_ROLE {:?}, hosting", other);
                Role::Host
            }
        };

        let display_name = non_empty("LASTCLICK_NAME");

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            lead: Duration::from_millis(parsed(
                "LASTCLICK_LEAD_MS",
                defaults.lead.as_millis() as u64,
            )),
            min_stop_secs: parsed("LASTCLICK_MIN_STOP", defaults.min_stop_secs),
            max_stop_secs: parsed("LASTCLICK_MAX_STOP", defaults.max_stop_secs),
            tail_margin_secs: parsed("LASTCLICK_TAIL_MARGIN", defaults.tail_margin_secs),
        };

        let scheduler = if scheduler.min_stop_secs > scheduler.max_stop_secs {
            tracing::warn!(
                "LASTCLICK_MIN_STOP ({}) exceeds LASTCLICK_MAX_STOP ({}); using defaults",
                scheduler.min_stop_secs,
                scheduler.max_stop_secs
            );
            SchedulerConfig {
                lead: scheduler.lead,
                ..defaults
            }
        } else {
            scheduler
        };

        Self {
            role,
            display_name,
            bind: parsed(
                "LASTCLICK_BIND",
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ),
            host_url: non_empty("LASTCLICK_HOST_URL"),
            room_id: non_empty("LASTCLICK_ROOM"),
            stimulus: non_empty("LASTCLICK_STIMULUS").map(PathBuf::from),
            state_file: non_empty("LASTCLICK_STATE_FILE").map(PathBuf::from),
            scheduler,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parsed<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match non_empty(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {} value {:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}

/// Two-word name for players who did not pick one
pub fn random_name() -> String {
    petname::petname(2, "-").unwrap_or_else(|| "player".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "LASTCLICK_ROLE",
        "LASTCLICK_NAME",
        "LASTCLICK_BIND",
        "LASTCLICK_HOST_URL",
        "LASTCLICK_ROOM",
        "LASTCLICK_STIMULUS",
        "LASTCLICK_STATE_FILE",
        "LASTCLICK_LEAD_MS",
        "LASTCLICK_MIN_STOP",
        "LASTCLICK_MAX_STOP",
        "LASTCLICK_TAIL_MARGIN",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    fn set(key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AppConfig::from_env();
        assert_eq!(config.role, Role::Host);
        assert_eq!(config.bind.port(), DEFAULT_PORT);
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert!(config.host_url.is_none());
        assert!(config.state_file.is_none());
        assert!(config.display_name.is_none());
        assert!(!random_name().is_empty());
    }

    #[test]
    #[serial]
    fn test_guest_from_env() {
        clear_env();
        set("LASTCLICK_ROLE", "guest");
        set("LASTCLICK_NAME", "  Gus ");
        set("LASTCLICK_HOST_URL", "ws://10.0.0.2:6574/ws");
        set("LASTCLICK_ROOM", "01J0ROOM");
        set("LASTCLICK_LEAD_MS", "2500");
        set("LASTCLICK_MAX_STOP", "12.5");

        let config = AppConfig::from_env();
        assert_eq!(config.role, Role::Guest);
        assert_eq!(config.display_name.as_deref(), Some("Gus"));
        assert_eq!(config.host_url.as_deref(), Some("ws://10.0.0.2:6574/ws"));
        assert_eq!(config.room_id.as_deref(), Some("01J0ROOM"));
        assert_eq!(config.scheduler.lead, Duration::from_millis(2500));
        assert_eq!(config.scheduler.max_stop_secs, 12.5);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        set("LASTCLICK_BIND", "not an address");
        set("LASTCLICK_LEAD_MS", "-4");
        set("LASTCLICK_MIN_STOP", "40");

        let config = AppConfig::from_env();
        assert_eq!(config.bind.port(), DEFAULT_PORT);
        assert_eq!(config.scheduler.lead, Duration::from_millis(1500));
        // min > max is rejected as a pair
        assert_eq!(config.scheduler.min_stop_secs, 3.0);
        assert_eq!(config.scheduler.max_stop_secs, 30.0);
        clear_env();
    }
}
