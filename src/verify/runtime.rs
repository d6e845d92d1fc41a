//! Proxy runtime abstraction and the Clash/mihomo subprocess implementation.

use std::io::Write;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::{RuntimeSettings, SWITCH_TIMEOUT};
use crate::error::{Error, Result};
use crate::geo::lookup::country_from_json;
use crate::models::{Country, Node};

/// Top-level selector the shared listener routes through.
pub const PROBE_SELECTOR: &str = "probe";

const READY_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct BatchMember {
    /// Unique proxy name inside the runtime config.
    pub alias: String,
    /// Single-member selector wrapping `alias`.
    pub group: String,
    pub node: Node,
}

/// What one runtime instance is asked to carry.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub index: usize,
    pub listen_port: u16,
    pub control_port: u16,
    pub members: Vec<BatchMember>,
}

impl BatchPlan {
    pub fn new(index: usize, nodes: impl IntoIterator<Item = Node>, listen_port: u16, control_port: u16) -> Self {
        let members = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| BatchMember { alias: format!("n{i}"), group: format!("g{i}"), node })
            .collect();
        Self { index, listen_port, control_port, members }
    }

    pub fn render_config(&self) -> Result<String> {
        let mut proxies = Vec::with_capacity(self.members.len());
        let mut groups = Vec::with_capacity(self.members.len() + 1);
        for member in &self.members {
            proxies.push(Value::Mapping(member.node.renamed(member.alias.clone()).to_clash()));
            groups.push(select_group(&member.group, vec![member.alias.clone()]));
        }
        groups.push(select_group(
            PROBE_SELECTOR,
            self.members.iter().map(|m| m.group.clone()).collect(),
        ));

        let mut doc = Mapping::new();
        doc.insert("mixed-port".into(), self.listen_port.into());
        doc.insert("bind-address".into(), "127.0.0.1".into());
        doc.insert("allow-lan".into(), false.into());
        doc.insert("mode".into(), "rule".into());
        doc.insert("log-level".into(), "silent".into());
        doc.insert("external-controller".into(), format!("127.0.0.1:{}", self.control_port).into());
        doc.insert("proxies".into(), Value::Sequence(proxies));
        doc.insert("proxy-groups".into(), Value::Sequence(groups));
        doc.insert("rules".into(), Value::Sequence(vec![format!("MATCH,{PROBE_SELECTOR}").into()]));

        Ok(serde_yaml::to_string(&doc)?)
    }
}

fn select_group(name: &str, members: Vec<String>) -> Value {
    let mut group = Mapping::new();
    group.insert("name".into(), name.into());
    group.insert("type".into(), "select".into());
    group.insert("proxies".into(), Value::Sequence(members.into_iter().map(Value::from).collect()));
    Value::Mapping(group)
}

/// Body of `PUT /proxies/{selector}`.
#[derive(Serialize)]
struct SelectRequest<'a> {
    name: &'a str,
}

/// What an egress endpoint told us about the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Egress {
    pub ip: Option<IpAddr>,
    pub country: Option<Country>,
}

/// Accepts a bare IP, or JSON with `ip`/`query`/`origin` and
/// `country`/`countryCode`.
pub fn parse_egress_body(body: &str) -> Option<Egress> {
    let body = body.trim();
    if body.starts_with('{') {
        let json: JsonValue = serde_json::from_str(body).ok()?;
        let ip = ["ip", "query", "origin"]
            .iter()
            .filter_map(|key| json.get(key).and_then(JsonValue::as_str))
            .find_map(|s| s.trim().parse::<IpAddr>().ok());
        let country = country_from_json(&json);
        if ip.is_none() && country.is_none() {
            return None;
        }
        return Some(Egress { ip, country });
    }
    body.parse::<IpAddr>().ok().map(|ip| Egress { ip: Some(ip), country: None })
}

/// A program that can carry a batch of nodes behind one local listener and
/// be steered through a control plane.
#[async_trait]
pub trait ProxyRuntime: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Starts an instance for `plan` and waits until it is controllable.
    async fn launch(&self, plan: &BatchPlan) -> Result<Self::Handle>;

    /// Points the shared listener at `member`.
    async fn switch_active(&self, handle: &Self::Handle, member: &BatchMember) -> Result<()>;

    /// Requests an egress endpoint through the shared listener.
    async fn probe_egress(&self, handle: &Self::Handle) -> Result<Egress>;

    /// Stops the instance and removes everything it owned.
    async fn teardown(&self, handle: Self::Handle);
}

pub struct MihomoRuntime {
    settings: RuntimeSettings,
    control: Client,
    probe_timeout: Duration,
}

pub struct MihomoHandle {
    child: Child,
    config: NamedTempFile,
    control_url: String,
    probe_client: Client,
}

impl MihomoRuntime {
    pub fn new(settings: RuntimeSettings, probe_timeout: Duration) -> Result<Self> {
        let control = Client::builder().no_proxy().timeout(SWITCH_TIMEOUT).build()?;
        Ok(Self { settings, control, probe_timeout })
    }

    async fn wait_ready(&self, handle: &mut MihomoHandle) -> Result<()> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        let url = format!("{}/version", handle.control_url);

        loop {
            if let Some(status) = handle.child.try_wait()? {
                return Err(Error::Launch(format!("exited early with {status}")));
            }
            if let Ok(response) = self.control.get(&url).send().await
                && response.status().is_success()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Launch(format!(
                    "control plane not ready after {:?}",
                    self.settings.ready_timeout
                )));
            }
            sleep(READY_POLL).await;
        }
    }
}

#[async_trait]
impl ProxyRuntime for MihomoRuntime {
    type Handle = MihomoHandle;

    async fn launch(&self, plan: &BatchPlan) -> Result<MihomoHandle> {
        let mut config = tempfile::Builder::new().prefix("node-sieve-").suffix(".yaml").tempfile()?;
        config.write_all(plan.render_config()?.as_bytes())?;
        config.flush()?;

        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("-f").arg(config.path());
        if let Some(dir) = &self.settings.workdir {
            cmd.arg("-d").arg(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::Launch(format!("{}: {e}", self.settings.binary.display())))?;
        debug!("Batch {} runtime started (pid {:?})", plan.index, child.id());

        let probe_client = Client::builder()
            .proxy(Proxy::all(format!("http://127.0.0.1:{}", plan.listen_port))?)
            .timeout(self.probe_timeout)
            // every probe must open a fresh connection through the current upstream
            .pool_max_idle_per_host(0)
            .build()?;

        let mut handle = MihomoHandle {
            child,
            config,
            control_url: format!("http://127.0.0.1:{}", plan.control_port),
            probe_client,
        };
        if let Err(e) = self.wait_ready(&mut handle).await {
            self.teardown(handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn switch_active(&self, handle: &MihomoHandle, member: &BatchMember) -> Result<()> {
        let url = format!("{}/proxies/{}", handle.control_url, PROBE_SELECTOR);
        let response = self
            .control
            .put(&url)
            .json(&SelectRequest { name: &member.group })
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::ControlPlane(format!("switch to {} returned {}", member.group, response.status())))
        }
    }

    async fn probe_egress(&self, handle: &MihomoHandle) -> Result<Egress> {
        request_egress(&handle.probe_client, &self.settings.egress_endpoints).await
    }

    async fn teardown(&self, handle: MihomoHandle) {
        let MihomoHandle { mut child, config, .. } = handle;
        terminate(&mut child, self.settings.grace_period).await;
        if let Err(e) = config.close() {
            warn!("Failed to remove runtime config: {}", e);
        }
    }
}

/// Requests the egress endpoints through `client` in order.
///
/// Any HTTP response from an endpoint means traffic went through, so the
/// result is `Ok` even when no endpoint yields an address. Only transport
/// failures, and the gateway errors the local listener emits when its
/// upstream is unusable, count as failure.
pub async fn request_egress(client: &Client, endpoints: &[String]) -> Result<Egress> {
    let mut reached = false;
    let mut last_error = String::from("no egress endpoints configured");

    for endpoint in endpoints {
        let response = match client.get(endpoint).send().await {
            Ok(response) => response,
            Err(e) => {
                last_error = format!("{endpoint}: {e}");
                continue;
            }
        };

        let status = response.status();
        if matches!(status, StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT) {
            last_error = format!("{endpoint}: listener returned {status}");
            continue;
        }
        reached = true;
        if !status.is_success() {
            debug!("{} answered {}, trying next endpoint", endpoint, status);
            continue;
        }

        match response.text().await {
            Ok(body) => match parse_egress_body(&body) {
                Some(egress) => return Ok(egress),
                None => debug!("{} returned an unrecognised body", endpoint),
            },
            Err(e) => debug!("{} body unreadable: {}", endpoint, e),
        }
    }

    if reached {
        Ok(Egress::default())
    } else {
        Err(Error::Probe(last_error))
    }
}

/// SIGTERM, wait up to `grace`, then kill.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is our own child and has not been reaped yet.
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if let Ok(Ok(_)) = timeout(grace, child.wait()).await {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!("Kill failed: {}", e);
    }
}
