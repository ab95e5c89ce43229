// Tunable parameters for relay connections and state broadcast.
//
// `SyncConfig` carries every knob the sync layer reads: relay address,
// broadcast cadence, and the reconnection backoff policy. Defaults match the
// hosted relay deployment. Durations are stored as millisecond integers so a
// config file stays plain JSON; the accessor methods convert to `Duration`.
//
// URL composition lives here too, because the relay address normalization
// rules are part of configuration rather than transport: a bare host or an
// `http(s)://` address becomes `wss://`, while an explicit `ws://` or `wss://`
// scheme is kept (local relays run without TLS).
//
// See also: `connection.rs`, which consumes the backoff policy and calls
// `relay_url` on every open attempt.

use std::path::Path;
use std::time::Duration;

use jam_protocol::types::{ParticipantId, SessionCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};

/// Hosted relay used when no server is configured.
pub const DEFAULT_SERVER: &str = "pomodoro-jam.treepo1.partykit.dev";

/// Relay connection and broadcast settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Relay address. `None` means `DEFAULT_SERVER`.
    pub server: Option<String>,
    /// Host state broadcast cadence.
    pub state_sync_interval_ms: u64,
    /// Reserved. Nothing in the sync layer enforces it yet.
    pub connection_timeout_ms: u64,
    /// Retries allowed after a drop before the connection gives up.
    pub max_reconnect_attempts: u32,
    /// First retry delay; each further retry doubles it.
    pub reconnect_delay_base_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: None,
            state_sync_interval_ms: 1000,
            connection_timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            reconnect_delay_base_ms: 1000,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn server_address(&self) -> &str {
        self.server.as_deref().unwrap_or(DEFAULT_SERVER)
    }

    /// Broadcast cadence, never shorter than 1 ms.
    pub fn state_sync_interval(&self) -> Duration {
        Duration::from_millis(self.state_sync_interval_ms.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn reconnect_delay_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_base_ms)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_delay_base().saturating_mul(1u32 << exponent)
    }

    /// Build the relay URL for one participant:
    /// `<scheme>://<server>/party/<code>?_pk=<id>&name=<name>&isHost=<bool>`.
    pub fn relay_url(
        &self,
        code: &SessionCode,
        participant_id: &ParticipantId,
        name: &str,
        is_host: bool,
    ) -> Result<Url> {
        let base = normalize_server(self.server_address());
        let mut url = Url::parse(&base)?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(SyncError::InvalidUrl(format!("no host in {base:?}")));
        }
        url.path_segments_mut()
            .map_err(|()| SyncError::InvalidUrl(format!("{base:?} cannot carry a path")))?
            .pop_if_empty()
            .push("party")
            .push(code.as_str());
        url.query_pairs_mut()
            .append_pair("_pk", participant_id.as_str())
            .append_pair("name", name)
            .append_pair("isHost", if is_host { "true" } else { "false" });
        Ok(url)
    }
}

/// Turn a configured server address into a WebSocket base URL string.
fn normalize_server(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("ws://") || server.starts_with("wss://") {
        return server.to_owned();
    }
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    format!("wss://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_for(server: Option<&str>) -> Result<Url> {
        let config = SyncConfig {
            server: server.map(str::to_owned),
            ..SyncConfig::default()
        };
        config.relay_url(
            &SessionCode::from("AB12CD"),
            &ParticipantId::from("h1"),
            "Ada & Bo",
            true,
        )
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.server_address(), DEFAULT_SERVER);
        assert_eq!(config.state_sync_interval(), Duration::from_millis(1000));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay_base(), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = SyncConfig::default();
        let delays: Vec<u128> = (1..=5)
            .map(|n| config.reconnect_delay(n).as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let config = SyncConfig {
            reconnect_delay_base_ms: u64::MAX / 2,
            ..SyncConfig::default()
        };
        assert_eq!(config.reconnect_delay(40), Duration::MAX);
    }

    #[test]
    fn default_server_url() {
        let url = url_for(None).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some(DEFAULT_SERVER));
        assert_eq!(url.path(), "/party/AB12CD");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("_pk".into(), "h1".into()),
                ("name".into(), "Ada & Bo".into()),
                ("isHost".into(), "true".into()),
            ]
        );
        assert!(!url.as_str().contains("Ada & Bo"), "name must be encoded");
    }

    #[test]
    fn strips_http_scheme() {
        let url = url_for(Some("https://relay.example.com/")).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("relay.example.com"));
        assert_eq!(url.path(), "/party/AB12CD");
    }

    #[test]
    fn keeps_explicit_ws_scheme() {
        let url = url_for(Some("ws://127.0.0.1:4000")).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(4000));
    }

    #[test]
    fn rejects_empty_server() {
        assert!(matches!(url_for(Some("")), Err(SyncError::InvalidUrl(_))));
        assert!(matches!(url_for(Some("   ")), Err(SyncError::InvalidUrl(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            SyncConfig::from_json_str(r#"{"server":"ws://localhost:1999","maxReconnectAttempts":3}"#)
                .unwrap();
        assert_eq!(config.server_address(), "ws://localhost:1999");
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.state_sync_interval_ms, 1000);
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            SyncConfig::from_json_str("{"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = SyncConfig {
            state_sync_interval_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.state_sync_interval(), Duration::from_millis(1));
    }
}
