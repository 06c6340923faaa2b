use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RemoteFlavor};
use crate::error::{Result, SchmuxError};
use crate::models::{RemoteHost, RemoteHostStatus};
use crate::session::SessionSupervisor;
use crate::state::StateStore;
use crate::tracker::StreamTracker;

/// How often the watcher re-parses the provisioning session's output.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);
/// Lines of scrollback the watcher inspects per poll.
const WATCH_LINES: u32 = 50;
/// Expiry ticker cadence.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle notifications other components subscribe to. `HostDown` is the
/// cue to cascade-dispose sessions and workspaces referencing the host.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Connected { host_id: String },
    HostDown { host_id: String },
}

/// Async connect/reconnect state machine fronting an interactive
/// provisioning shell the user may need to authenticate against.
pub struct RemoteHostManager {
    store: Arc<StateStore>,
    config: Arc<RwLock<Config>>,
    supervisor: Arc<SessionSupervisor>,
    watchers: Mutex<HashMap<String, CancellationToken>>,
    events: broadcast::Sender<RemoteEvent>,
}

/// Outcome of a connect request: either a fresh provisioning flow or the
/// already-connected host for the flavor.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Started {
        host: RemoteHost,
        provisioning_session_id: String,
    },
    AlreadyConnected(RemoteHost),
}

impl RemoteHostManager {
    pub fn new(
        store: Arc<StateStore>,
        config: Arc<RwLock<Config>>,
        supervisor: Arc<SessionSupervisor>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            config,
            supervisor,
            watchers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    /// Declarative "connect to flavor F". Idempotent: a flavor with an
    /// already-connected host returns that host unchanged.
    pub async fn start_connect(self: &Arc<Self>, flavor_id: &str) -> Result<ConnectOutcome> {
        let flavor = self
            .config
            .read()
            .await
            .flavor(flavor_id)
            .cloned()
            .ok_or_else(|| SchmuxError::NotFound(format!("unknown remote flavor {flavor_id}")))?;

        if let Some(existing) = self.store.connected_host_for_flavor(flavor_id).await {
            return Ok(ConnectOutcome::AlreadyConnected(existing));
        }

        let host_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let host = RemoteHost {
            id: host_id.clone(),
            flavor_id: flavor_id.to_string(),
            hostname: None,
            status: RemoteHostStatus::Provisioning,
            connected_at: None,
            expires_at: None,
            provisioning_session_id: None,
        };
        self.store.add_remote_host(host).await?;

        let psid = match self
            .launch_provisioning(&host_id, &flavor, &flavor.connect_cmd)
            .await
        {
            Ok(psid) => psid,
            Err(e) => {
                // Never leave a half-created host record behind.
                let _ = self.store.remove_remote_host(&host_id).await;
                return Err(e);
            }
        };
        let host = self
            .store
            .update_remote_host(&host_id, |h| {
                h.provisioning_session_id = Some(psid.clone());
            })
            .await?;

        self.spawn_watcher(&host_id, &flavor).await;
        Ok(ConnectOutcome::Started {
            host,
            provisioning_session_id: psid,
        })
    }

    /// Drive a `disconnected`/`expired` host back through the FSM with the
    /// flavor's reconnect command. A watcher timeout publishes `HostDown`,
    /// which subscribers use to cascade-delete dependents.
    pub async fn start_reconnect(self: &Arc<Self>, host_id: &str) -> Result<String> {
        let host = self
            .store
            .get_remote_host(host_id)
            .await
            .ok_or_else(|| SchmuxError::NotFound(format!("remote host {host_id} not found")))?;
        if !matches!(
            host.status,
            RemoteHostStatus::Disconnected | RemoteHostStatus::Expired
        ) {
            return Err(SchmuxError::Conflict(format!(
                "host {host_id} is {:?}, not reconnectable",
                host.status
            )));
        }

        let flavor = self
            .config
            .read()
            .await
            .flavor(&host.flavor_id)
            .cloned()
            .ok_or_else(|| {
                SchmuxError::NotFound(format!("flavor {} no longer configured", host.flavor_id))
            })?;

        let psid = self
            .launch_provisioning(host_id, &flavor, &flavor.reconnect_cmd)
            .await?;
        self.store
            .update_remote_host(host_id, |h| {
                h.status = RemoteHostStatus::Reconnecting;
                h.provisioning_session_id = Some(psid.clone());
            })
            .await?;

        self.spawn_watcher(host_id, &flavor).await;
        Ok(psid)
    }

    pub async fn disconnect(&self, host_id: &str) -> Result<()> {
        let host = self
            .store
            .get_remote_host(host_id)
            .await
            .ok_or_else(|| SchmuxError::NotFound(format!("remote host {host_id} not found")))?;

        if let Some(token) = self.watchers.lock().await.remove(host_id) {
            token.cancel();
        }
        self.teardown_provisioning(&host).await;
        self.store
            .update_remote_host(host_id, |h| {
                h.status = RemoteHostStatus::Disconnected;
                h.provisioning_session_id = None;
            })
            .await?;
        let _ = self.events.send(RemoteEvent::HostDown {
            host_id: host_id.to_string(),
        });
        Ok(())
    }

    /// Scan all hosts, flipping `connected` past their TTL to `expired`.
    pub fn start_expiry_ticker(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXPIRY_INTERVAL).await;
                let now = Utc::now();
                for host in this.store.list_remote_hosts().await {
                    if should_expire(&host, now) {
                        info!("remote host {} expired", host.id);
                        let _ = this
                            .store
                            .update_remote_host(&host.id, |h| {
                                h.status = RemoteHostStatus::Expired;
                            })
                            .await;
                        let _ = this.events.send(RemoteEvent::HostDown {
                            host_id: host.id.clone(),
                        });
                    }
                }
            }
        });
    }

    async fn launch_provisioning(
        &self,
        host_id: &str,
        flavor: &RemoteFlavor,
        command: &str,
    ) -> Result<String> {
        let psid = format!("provision-{host_id}");
        let tmux_name = format!("schmux-provision-{host_id}");
        let cwd = dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        let tmux = self.supervisor.tmux();
        tmux.new_session(&tmux_name, &cwd, command, &[]).await?;

        // Bridge the interactive shell exactly like an agent session, minus
        // the log pipe and bootstrap filtering.
        let tracker = StreamTracker::new(
            psid.clone(),
            tmux_name,
            tmux.clone(),
            Vec::new(),
            self.supervisor_log_path(&psid),
            u64::MAX,
            u64::MAX,
            self.supervisor.tracker_events(),
        );
        self.supervisor.register_provision_tracker(&psid, tracker);
        debug!("provisioning session {psid} started for flavor {}", flavor.id);
        Ok(psid)
    }

    fn supervisor_log_path(&self, psid: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("schmux-{psid}.log"))
    }

    async fn teardown_provisioning(&self, host: &RemoteHost) {
        if let Some(psid) = &host.provisioning_session_id {
            let tmux_name = format!("schmux-provision-{}", host.id);
            if let Err(e) = self.supervisor.tmux().kill_session(&tmux_name).await {
                debug!("killing provisioning session {tmux_name}: {e}");
            }
            if let Some(tracker) = self.supervisor.tracker(psid) {
                tracker.stop().await;
            }
        }
    }

    /// At most one watcher per host: spawning replaces (cancels) a previous
    /// one.
    async fn spawn_watcher(self: &Arc<Self>, host_id: &str, flavor: &RemoteFlavor) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .watchers
            .lock()
            .await
            .insert(host_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let host_id = host_id.to_string();
        let flavor = flavor.clone();
        tokio::spawn(async move {
            this.watch(host_id, flavor, token).await;
        });
    }

    async fn watch(self: Arc<Self>, host_id: String, flavor: RemoteFlavor, token: CancellationToken) {
        let pattern = match regex::Regex::new(&flavor.hostname_pattern) {
            Ok(p) => p,
            Err(e) => {
                warn!("flavor {} hostname pattern invalid: {e}", flavor.id);
                self.mark_down(&host_id).await;
                return;
            }
        };
        let deadline = {
            let config = self.config.read().await;
            Duration::from_secs(config.internal.provision_timeout_secs)
        };
        let ttl = {
            let config = self.config.read().await;
            Duration::from_secs(config.internal.remote_ttl_secs)
        };
        let tmux_name = format!("schmux-provision-{host_id}");
        let started = tokio::time::Instant::now();
        // Poll with a short deadline so a wedged multiplexer cannot stall
        // the watcher across its whole interval.
        let tmux = self.supervisor.tmux().with_timeout(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            }
            if started.elapsed() > deadline {
                warn!("provisioning for host {host_id} timed out");
                self.mark_down(&host_id).await;
                return;
            }

            match tmux.capture_pane(&tmux_name, WATCH_LINES, false).await {
                Ok(output) => {
                    let text = String::from_utf8_lossy(&output);
                    if let Some(hostname) = extract_hostname(&pattern, &text) {
                        info!("host {host_id} connected as {hostname}");
                        let now = Utc::now();
                        let _ = self
                            .store
                            .update_remote_host(&host_id, |h| {
                                h.status = RemoteHostStatus::Connecting;
                            })
                            .await;
                        let _ = self
                            .store
                            .update_remote_host(&host_id, |h| {
                                h.status = RemoteHostStatus::Connected;
                                h.hostname = Some(hostname.clone());
                                h.connected_at = Some(now);
                                h.expires_at =
                                    Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
                            })
                            .await;
                        let _ = self.events.send(RemoteEvent::Connected {
                            host_id: host_id.clone(),
                        });
                        self.watchers.lock().await.remove(&host_id);
                        return;
                    }
                }
                Err(SchmuxError::NotFound(_)) => {
                    // The provisioning shell exited before a hostname showed.
                    debug!("provisioning session for {host_id} ended before a match");
                    self.mark_down(&host_id).await;
                    return;
                }
                Err(e) => {
                    debug!("watcher capture for {host_id}: {e}");
                }
            }
        }
    }

    async fn mark_down(&self, host_id: &str) {
        if let Some(host) = self.store.get_remote_host(host_id).await {
            self.teardown_provisioning(&host).await;
        }
        let _ = self
            .store
            .update_remote_host(host_id, |h| {
                h.status = RemoteHostStatus::Disconnected;
                h.provisioning_session_id = None;
            })
            .await;
        self.watchers.lock().await.remove(host_id);
        let _ = self.events.send(RemoteEvent::HostDown {
            host_id: host_id.to_string(),
        });
    }
}

/// First capture group if the pattern has one, else the whole match.
pub fn extract_hostname(pattern: &regex::Regex, text: &str) -> Option<String> {
    let captures = pattern.captures(text)?;
    let hostname = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())?;
    Some(hostname).filter(|h| !h.is_empty())
}

pub fn should_expire(host: &RemoteHost, now: DateTime<Utc>) -> bool {
    host.status == RemoteHostStatus::Connected
        && host.expires_at.map(|at| now > at).unwrap_or(false)
}
