//! WireGuard через утилиту `wg`: пиры, адреса, счётчики трафика интерфейса.

use super::{
    BackendError, BackendStatus, HealthStatus, Provisioned, UsageRecord, VpnBackendClient,
    validate_display_name, with_timeout,
};
use crate::config::{ConfigError, WireguardConfig, parse_subnet};
use crate::model::{VpnKey, unix_now};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

/// Пир считается активным, если рукопожатие было не раньше этого срока.
const ACTIVE_HANDSHAKE_WINDOW_SECS: i64 = 180;

/// Канал управления интерфейсом.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WgControl: Send + Sync {
    /// Запускает `wg` с аргументами, возвращает stdout.
    async fn wg(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, BackendError>;

    /// Сохраняет текущее состояние интерфейса в конфиг (`wg-quick save`).
    async fn save(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
pub struct WgCommand {
    wg_binary: String,
    interface: String,
    timeout: Duration,
}

impl WgCommand {
    pub fn new(wg_binary: impl Into<String>, interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            wg_binary: wg_binary.into(),
            interface: interface.into(),
            timeout,
        }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, BackendError> {
        tracing::debug!(program = program, args = ?args, "Running WireGuard command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(program = program, error = %e, "Failed to execute WireGuard tool");
                BackendError::Unavailable(format!("не удалось запустить {}: {}", program, e))
            })?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| BackendError::Unavailable(format!("запись в stdin {}: {}", program, e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Unavailable(format!("ожидание {}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                program = program,
                stderr = %stderr,
                "WireGuard command returned non-zero status"
            );
            Err(classify_failure(&stderr))
        }
    }
}

#[async_trait]
impl WgControl for WgCommand {
    async fn wg(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, BackendError> {
        with_timeout(
            self.timeout,
            "wg",
            self.run(&self.wg_binary, &args, stdin.as_deref()),
        )
        .await
    }

    async fn save(&self) -> Result<(), BackendError> {
        let args = vec!["save".to_string(), self.interface.clone()];
        with_timeout(self.timeout, "wg-quick save", self.run("wg-quick", &args, None))
            .await
            .map(|_| ())
    }
}

/// Переводит stderr утилиты в таксономию ошибок бэкенда.
pub fn classify_failure(stderr: &str) -> BackendError {
    let lower = stderr.to_lowercase();
    if lower.contains("not the correct length or format")
        || lower.contains("invalid")
        || lower.contains("parse")
    {
        BackendError::InvalidInput(stderr.to_string())
    } else if lower.contains("operation not permitted") || lower.contains("permission denied") {
        BackendError::Unavailable(format!("нет прав на управление интерфейсом: {}", stderr))
    } else if lower.contains("unable to access interface") || lower.contains("no such device") {
        BackendError::Unavailable(format!("интерфейс недоступен: {}", stderr))
    } else {
        BackendError::Unavailable(stderr.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDump {
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub peers: Vec<PeerDump>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: i64,
    pub transfer_rx: i64,
    pub transfer_tx: i64,
}

impl InterfaceDump {
    pub fn peer(&self, public_key: &str) -> Option<&PeerDump> {
        self.peers.iter().find(|peer| peer.public_key == public_key)
    }

    pub fn used_addresses(&self) -> HashSet<Ipv4Addr> {
        self.peers
            .iter()
            .flat_map(|peer| peer.allowed_ips.iter())
            .filter_map(|cidr| cidr.split('/').next())
            .filter_map(|addr| addr.parse::<Ipv4Addr>().ok())
            .collect()
    }
}

fn malformed(line: &str) -> BackendError {
    BackendError::Unavailable(format!("неразборчивый вывод wg show dump: {}", line))
}

fn parse_counter(value: &str, line: &str) -> Result<i64, BackendError> {
    value.parse::<i64>().map_err(|_| malformed(line))
}

/// Разбирает вывод `wg show <if> dump`.
///
/// Первая строка описывает интерфейс (4 поля), остальные строки описывают
/// пиров (8 полей). Поля разделены табуляцией.
pub fn parse_dump(raw: &str) -> Result<InterfaceDump, BackendError> {
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| malformed("<пусто>"))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() != 4 {
        return Err(malformed(header));
    }
    let listen_port = fields[2].parse::<u16>().ok();
    let mut dump = InterfaceDump {
        public_key: fields[1].to_string(),
        listen_port,
        peers: Vec::new(),
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 8 {
            return Err(malformed(line));
        }
        let allowed_ips = if fields[3] == "(none)" {
            Vec::new()
        } else {
            fields[3].split(',').map(|ip| ip.trim().to_string()).collect()
        };
        dump.peers.push(PeerDump {
            public_key: fields[0].to_string(),
            allowed_ips,
            latest_handshake: parse_counter(fields[4], line)?,
            transfer_rx: parse_counter(fields[5], line)?,
            transfer_tx: parse_counter(fields[6], line)?,
        });
    }
    Ok(dump)
}

/// Первый свободный адрес хоста; адрес сети+1 занят сервером.
pub fn allocate_address(network: Ipv4Addr, prefix: u8, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let base = u32::from(network);
    let size = 1u32 << (32 - u32::from(prefix));
    (2..size.saturating_sub(1))
        .map(|offset| Ipv4Addr::from(base + offset))
        .find(|addr| !used.contains(addr))
}

fn is_wireguard_key(value: &str) -> bool {
    BASE64
        .decode(value)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::from(rand::random::<[u8; 32]>());
    let public = PublicKey::from(&secret);
    (BASE64.encode(secret.to_bytes()), BASE64.encode(public.as_bytes()))
}

fn generate_preshared_key() -> String {
    BASE64.encode(rand::random::<[u8; 32]>())
}

/// `PresharedKey` из выданного клиенту конфига.
pub fn preshared_key_from_config(client_config: &str) -> Option<&str> {
    client_config
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(name, _)| name.trim() == "PresharedKey")
        .map(|(_, value)| value.trim())
        .filter(|value| is_wireguard_key(value))
}

/// Адрес принадлежит только этому пиру.
fn holds_address(dump: &InterfaceDump, public_key: &str, cidr: &str) -> bool {
    let ours = dump
        .peer(public_key)
        .is_some_and(|peer| peer.allowed_ips.iter().any(|ip| ip == cidr));
    let shared = dump
        .peers
        .iter()
        .any(|peer| peer.public_key != public_key && peer.allowed_ips.iter().any(|ip| ip == cidr));
    ours && !shared
}

pub struct ClientConfigParams<'a> {
    pub display_name: &'a str,
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub dns: &'a [String],
    pub server_public_key: &'a str,
    pub preshared_key: &'a str,
    pub endpoint: &'a str,
    pub persistent_keepalive: u16,
}

pub fn render_client_config(params: &ClientConfigParams<'_>) -> String {
    let mut out = format!(
        "# {}\n[Interface]\nPrivateKey = {}\nAddress = {}/32\n",
        params.display_name, params.private_key, params.address
    );
    if !params.dns.is_empty() {
        out.push_str(&format!("DNS = {}\n", params.dns.join(", ")));
    }
    out.push_str(&format!(
        "\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nEndpoint = {}\nAllowedIPs = 0.0.0.0/0, ::/0\n",
        params.server_public_key, params.preshared_key, params.endpoint
    ));
    if params.persistent_keepalive > 0 {
        out.push_str(&format!(
            "PersistentKeepalive = {}\n",
            params.persistent_keepalive
        ));
    }
    out
}

fn usage_from_peer(peer: &PeerDump, now: i64) -> UsageRecord {
    let recent = peer.latest_handshake > 0
        && now.saturating_sub(peer.latest_handshake) <= ACTIVE_HANDSHAKE_WINDOW_SECS;
    UsageRecord {
        bytes_transferred: peer.transfer_rx.saturating_add(peer.transfer_tx),
        backend_status: if recent {
            BackendStatus::Active
        } else {
            BackendStatus::Inactive
        },
    }
}

fn parse_version(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .find(|token| token.starts_with('v'))
        .map(|token| token.to_string())
}

pub struct WireguardClient {
    control: Arc<dyn WgControl>,
    config: WireguardConfig,
    network: Ipv4Addr,
    prefix: u8,
    /// Держится от чтения списка пиров до проверки выданного адреса.
    provision_lock: Mutex<()>,
}

impl WireguardClient {
    pub fn new(config: WireguardConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let control = Arc::new(WgCommand::new(
            config.wg_binary.clone(),
            config.interface.clone(),
            timeout,
        ));
        Self::with_control(config, control)
    }

    pub fn with_control(
        config: WireguardConfig,
        control: Arc<dyn WgControl>,
    ) -> Result<Self, ConfigError> {
        let (network, prefix) = parse_subnet(&config.subnet)?;
        Ok(Self {
            control,
            config,
            network,
            prefix,
            provision_lock: Mutex::new(()),
        })
    }

    async fn dump(&self) -> Result<InterfaceDump, BackendError> {
        let raw = self
            .control
            .wg(
                vec![
                    "show".to_string(),
                    self.config.interface.clone(),
                    "dump".to_string(),
                ],
                None,
            )
            .await?;
        parse_dump(&raw)
    }

    fn ensure_key(&self, external_reference: &str) -> Result<(), BackendError> {
        if is_wireguard_key(external_reference) {
            Ok(())
        } else {
            Err(BackendError::InvalidInput(format!(
                "некорректный публичный ключ пира: {}",
                external_reference
            )))
        }
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), BackendError> {
        self.control
            .wg(
                vec![
                    "set".to_string(),
                    self.config.interface.clone(),
                    "peer".to_string(),
                    public_key.to_string(),
                    "remove".to_string(),
                ],
                None,
            )
            .await
            .map(|_| ())
    }

    /// Перечитывает интерфейс после `wg set`: адрес мог занять пир,
    /// добавленный в обход этого процесса. Тогда свой пир снимается.
    async fn confirm_address(&self, public_key: &str, address: Ipv4Addr) -> Result<(), BackendError> {
        let cidr = format!("{}/32", address);
        let confirmed = match self.dump().await {
            Ok(dump) => holds_address(&dump, public_key, &cidr),
            Err(error) => {
                tracing::warn!(peer = %public_key, error = %error, "Failed to re-read WireGuard peers");
                false
            }
        };
        if confirmed {
            return Ok(());
        }

        tracing::warn!(
            interface = %self.config.interface,
            peer = %public_key,
            address = %address,
            "WireGuard address taken concurrently, rolling back peer"
        );
        if let Err(error) = self.remove_peer(public_key).await {
            tracing::error!(peer = %public_key, error = %error, "Failed to roll back WireGuard peer");
        }
        Err(BackendError::Unavailable(format!(
            "адрес {} занят параллельно созданным пиром, повторите позже",
            address
        )))
    }

    async fn persist(&self) {
        if !self.config.save_config {
            return;
        }
        if let Err(error) = self.control.save().await {
            tracing::warn!(
                interface = %self.config.interface,
                error = %error,
                "Не удалось сохранить конфиг WireGuard, изменения живут до перезапуска интерфейса"
            );
        }
    }
}

#[async_trait]
impl VpnBackendClient for WireguardClient {
    async fn provision(
        &self,
        display_name: &str,
        _data_limit_bytes: i64,
    ) -> Result<Provisioned, BackendError> {
        let display_name = validate_display_name(display_name)?;
        let _guard = self.provision_lock.lock().await;
        let dump = self.dump().await?;

        if let Some(max_peers) = self.config.max_peers
            && dump.peers.len() >= max_peers
        {
            return Err(BackendError::QuotaExceeded(format!(
                "на интерфейсе {} уже {} пиров из {}",
                self.config.interface,
                dump.peers.len(),
                max_peers
            )));
        }

        let address = allocate_address(self.network, self.prefix, &dump.used_addresses())
            .ok_or_else(|| {
                BackendError::QuotaExceeded(format!(
                    "в подсети {} не осталось свободных адресов",
                    self.config.subnet
                ))
            })?;

        let (private_key, public_key) = generate_keypair();
        let preshared_key = generate_preshared_key();

        self.control
            .wg(
                vec![
                    "set".to_string(),
                    self.config.interface.clone(),
                    "peer".to_string(),
                    public_key.clone(),
                    "preshared-key".to_string(),
                    "/dev/stdin".to_string(),
                    "allowed-ips".to_string(),
                    format!("{}/32", address),
                ],
                Some(preshared_key.clone()),
            )
            .await?;
        self.confirm_address(&public_key, address).await?;
        self.persist().await;

        tracing::info!(
            interface = %self.config.interface,
            peer = %public_key,
            address = %address,
            "WireGuard peer added"
        );

        let config = render_client_config(&ClientConfigParams {
            display_name,
            private_key: &private_key,
            address,
            dns: &self.config.dns,
            server_public_key: &dump.public_key,
            preshared_key: &preshared_key,
            endpoint: &self.config.endpoint,
            persistent_keepalive: self.config.persistent_keepalive,
        });

        Ok(Provisioned {
            external_reference: public_key,
            credential_material: config,
        })
    }

    async fn deprovision(&self, external_reference: &str) -> Result<bool, BackendError> {
        self.ensure_key(external_reference)?;
        let dump = self.dump().await?;
        if dump.peer(external_reference).is_none() {
            tracing::info!(peer = %external_reference, "WireGuard peer already absent");
            return Ok(false);
        }

        self.remove_peer(external_reference).await?;
        self.persist().await;

        tracing::info!(peer = %external_reference, "WireGuard peer removed");
        Ok(true)
    }

    async fn get_usage(&self, external_reference: &str) -> Result<UsageRecord, BackendError> {
        self.ensure_key(external_reference)?;
        let dump = self.dump().await?;
        Ok(dump
            .peer(external_reference)
            .map(|peer| usage_from_peer(peer, unix_now()))
            .unwrap_or_else(UsageRecord::not_found))
    }

    /// Приостановка меняет PresharedKey пира на случайный: рукопожатие клиента
    /// перестаёт проходить, а адрес остаётся закреплён за пиром.
    /// Возобновление возвращает ключ из выданного клиенту конфига.
    async fn set_enabled(&self, key: &VpnKey, enabled: bool) -> Result<bool, BackendError> {
        self.ensure_key(&key.external_reference)?;
        let preshared_key = if enabled {
            preshared_key_from_config(&key.credential_material)
                .map(str::to_string)
                .ok_or_else(|| {
                    BackendError::InvalidInput(format!(
                        "в конфиге ключа #{} нет PresharedKey",
                        key.id
                    ))
                })?
        } else {
            generate_preshared_key()
        };

        let dump = self.dump().await?;
        if dump.peer(&key.external_reference).is_none() {
            tracing::info!(peer = %key.external_reference, enabled, "WireGuard peer absent");
            return Ok(false);
        }

        self.control
            .wg(
                vec![
                    "set".to_string(),
                    self.config.interface.clone(),
                    "peer".to_string(),
                    key.external_reference.clone(),
                    "preshared-key".to_string(),
                    "/dev/stdin".to_string(),
                ],
                Some(preshared_key),
            )
            .await?;
        self.persist().await;

        tracing::info!(peer = %key.external_reference, enabled, "WireGuard peer access changed");
        Ok(true)
    }

    async fn health_check(&self) -> HealthStatus {
        let reachable = self
            .control
            .wg(
                vec![
                    "show".to_string(),
                    self.config.interface.clone(),
                    "public-key".to_string(),
                ],
                None,
            )
            .await;
        if let Err(error) = reachable {
            return HealthStatus::unhealthy(error.to_string());
        }
        let version = self
            .control
            .wg(vec!["--version".to_string()], None)
            .await
            .ok()
            .and_then(|raw| parse_version(&raw));
        HealthStatus::healthy(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_PUB: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";
    const PEER_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PEER_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

    fn dump_text(now: i64) -> String {
        format!(
            "cFBpcml2YXRla2V5cHJpdmF0ZWtleXByaXZhdGVrZXk=\t{SERVER_PUB}\t51820\toff\n\
             {PEER_A}\t(none)\t198.51.100.7:40312\t10.8.0.2/32\t{}\t1000\t2000\t25\n\
             {PEER_B}\t(none)\t(none)\t10.8.0.3/32,fd00::3/128\t0\t0\t0\toff\n",
            now - 30
        )
    }

    fn wg_config(max_peers: Option<usize>) -> WireguardConfig {
        WireguardConfig {
            interface: "wg0".to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            subnet: "10.8.0.0/24".to_string(),
            dns: vec!["1.1.1.1".to_string()],
            max_peers,
            persistent_keepalive: 25,
            save_config: false,
            wg_binary: "wg".to_string(),
        }
    }

    fn is_dump_call(args: &[String]) -> bool {
        args.last().map(String::as_str) == Some("dump")
    }

    #[test]
    fn dump_is_parsed_with_peers_and_counters() {
        let dump = parse_dump(&dump_text(1_000_000)).unwrap();
        assert_eq!(dump.public_key, SERVER_PUB);
        assert_eq!(dump.listen_port, Some(51820));
        assert_eq!(dump.peers.len(), 2);
        let a = dump.peer(PEER_A).unwrap();
        assert_eq!(a.transfer_rx, 1000);
        assert_eq!(a.transfer_tx, 2000);
        let used = dump.used_addresses();
        assert!(used.contains(&Ipv4Addr::new(10, 8, 0, 2)));
        assert!(used.contains(&Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn truncated_dump_is_unavailable_not_panic() {
        let raw = format!("k\t{SERVER_PUB}\t51820\toff\n{PEER_A}\t(none)\n");
        assert!(matches!(parse_dump(&raw), Err(BackendError::Unavailable(_))));
        assert!(matches!(parse_dump(""), Err(BackendError::Unavailable(_))));
        let raw = format!(
            "k\t{SERVER_PUB}\t51820\toff\n{PEER_A}\t(none)\t(none)\t(none)\t0\tlots\t0\toff\n"
        );
        assert!(matches!(parse_dump(&raw), Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn stderr_is_classified() {
        assert!(matches!(
            classify_failure("Unable to access interface: No such device"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("Unable to modify interface: Operation not permitted"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("Key is not the correct length or format: `abc'"),
            BackendError::InvalidInput(_)
        ));
    }

    #[test]
    fn address_allocation_skips_server_and_used() {
        let net = Ipv4Addr::new(10, 8, 0, 0);
        let mut used = HashSet::new();
        assert_eq!(allocate_address(net, 24, &used), Some(Ipv4Addr::new(10, 8, 0, 2)));
        used.insert(Ipv4Addr::new(10, 8, 0, 2));
        used.insert(Ipv4Addr::new(10, 8, 0, 4));
        assert_eq!(allocate_address(net, 24, &used), Some(Ipv4Addr::new(10, 8, 0, 3)));

        // /30: сеть, сервер, один клиент, broadcast
        let mut tiny = HashSet::new();
        assert_eq!(allocate_address(net, 30, &tiny), Some(Ipv4Addr::new(10, 8, 0, 2)));
        tiny.insert(Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(allocate_address(net, 30, &tiny), None);
    }

    #[test]
    fn client_config_contains_peer_section() {
        let text = render_client_config(&ClientConfigParams {
            display_name: "phone",
            private_key: "priv",
            address: Ipv4Addr::new(10, 8, 0, 5),
            dns: &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            server_public_key: SERVER_PUB,
            preshared_key: "psk",
            endpoint: "vpn.example.com:51820",
            persistent_keepalive: 25,
        });
        assert!(text.contains("Address = 10.8.0.5/32"));
        assert!(text.contains("DNS = 1.1.1.1, 8.8.8.8"));
        assert!(text.contains(&format!("PublicKey = {SERVER_PUB}")));
        assert!(text.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn handshake_age_decides_status() {
        let peer = PeerDump {
            public_key: PEER_A.to_string(),
            allowed_ips: vec![],
            latest_handshake: 1_000,
            transfer_rx: 5,
            transfer_tx: 7,
        };
        assert_eq!(usage_from_peer(&peer, 1_100).backend_status, BackendStatus::Active);
        assert_eq!(usage_from_peer(&peer, 2_000).backend_status, BackendStatus::Inactive);
        assert_eq!(usage_from_peer(&peer, 1_100).bytes_transferred, 12);
        let never = PeerDump {
            latest_handshake: 0,
            ..peer
        };
        assert_eq!(usage_from_peer(&never, 10).backend_status, BackendStatus::Inactive);
    }

    #[derive(Debug, Clone)]
    struct FakePeer {
        public_key: String,
        preshared_key: Option<String>,
        allowed_ip: Option<String>,
    }

    /// Интерфейс в памяти. `wg set` с чужим адресом снимает его с прежнего
    /// пира, как это делает ядро.
    struct FakeInterface {
        peers: std::sync::Mutex<Vec<FakePeer>>,
        /// Пир, который забирает каждый выданный адрес сразу после `wg set`.
        intruder: Option<&'static str>,
    }

    impl FakeInterface {
        fn with_peers(peers: &[(&str, &str)]) -> Self {
            Self {
                peers: std::sync::Mutex::new(
                    peers
                        .iter()
                        .map(|(key, ip)| FakePeer {
                            public_key: key.to_string(),
                            preshared_key: None,
                            allowed_ip: Some(ip.to_string()),
                        })
                        .collect(),
                ),
                intruder: None,
            }
        }

        fn peers(&self) -> Vec<FakePeer> {
            self.peers.lock().unwrap().clone()
        }

        fn assign(peers: &mut Vec<FakePeer>, public_key: &str, ip: &str) {
            for peer in peers.iter_mut() {
                if peer.allowed_ip.as_deref() == Some(ip) {
                    peer.allowed_ip = None;
                }
            }
            match peers.iter_mut().find(|peer| peer.public_key == public_key) {
                Some(peer) => peer.allowed_ip = Some(ip.to_string()),
                None => peers.push(FakePeer {
                    public_key: public_key.to_string(),
                    preshared_key: None,
                    allowed_ip: Some(ip.to_string()),
                }),
            }
        }
    }

    #[async_trait]
    impl WgControl for FakeInterface {
        async fn wg(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, BackendError> {
            tokio::task::yield_now().await;
            let mut peers = self.peers.lock().unwrap();
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["show", _, "dump"] => {
                    let mut out = format!("priv\t{SERVER_PUB}\t51820\toff\n");
                    for peer in peers.iter() {
                        out.push_str(&format!(
                            "{}\t{}\t(none)\t{}\t0\t0\t0\toff\n",
                            peer.public_key,
                            peer.preshared_key.as_deref().unwrap_or("(none)"),
                            peer.allowed_ip.as_deref().unwrap_or("(none)")
                        ));
                    }
                    Ok(out)
                }
                ["set", _, "peer", key, "remove"] => {
                    peers.retain(|peer| peer.public_key != *key);
                    Ok(String::new())
                }
                ["set", _, "peer", key, "preshared-key", "/dev/stdin", "allowed-ips", ip] => {
                    Self::assign(&mut peers, key, ip);
                    if let Some(peer) = peers.iter_mut().find(|peer| peer.public_key == *key) {
                        peer.preshared_key = stdin;
                    }
                    if let Some(intruder) = self.intruder {
                        Self::assign(&mut peers, intruder, ip);
                    }
                    Ok(String::new())
                }
                ["set", _, "peer", key, "preshared-key", "/dev/stdin"] => {
                    match peers.iter_mut().find(|peer| peer.public_key == *key) {
                        Some(peer) => {
                            peer.preshared_key = stdin;
                            Ok(String::new())
                        }
                        None => Err(BackendError::InvalidInput(format!("no peer {}", key))),
                    }
                }
                other => Err(BackendError::InvalidInput(format!("unexpected {:?}", other))),
            }
        }

        async fn save(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn stored_key(public_key: &str, credential_material: String) -> VpnKey {
        VpnKey {
            id: 1,
            owner_id: 7,
            backend_type: crate::model::BackendType::Wireguard,
            display_name: "laptop".to_string(),
            external_reference: public_key.to_string(),
            credential_material,
            is_active: true,
            data_limit_bytes: 0,
            used_bytes: 0,
            last_counter_bytes: 0,
            billing_cycle_start: 0,
            created_at: 0,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn provision_allocates_next_address_and_adds_peer() {
        let interface = Arc::new(FakeInterface::with_peers(&[
            (PEER_A, "10.8.0.2/32"),
            (PEER_B, "10.8.0.3/32"),
        ]));
        let client = WireguardClient::with_control(wg_config(None), interface.clone()).unwrap();
        let provisioned = client.provision("laptop", 0).await.unwrap();
        assert!(is_wireguard_key(&provisioned.external_reference));
        assert!(provisioned.credential_material.contains("Address = 10.8.0.4/32"));
        assert!(provisioned.credential_material.contains(SERVER_PUB));

        let peers = interface.peers();
        let added = peers
            .iter()
            .find(|peer| peer.public_key == provisioned.external_reference)
            .unwrap();
        assert_eq!(added.allowed_ip.as_deref(), Some("10.8.0.4/32"));
        assert_eq!(
            added.preshared_key.as_deref(),
            preshared_key_from_config(&provisioned.credential_material)
        );
    }

    #[tokio::test]
    async fn concurrent_provisions_get_distinct_addresses() {
        let interface = Arc::new(FakeInterface::with_peers(&[(PEER_A, "10.8.0.2/32")]));
        let client = WireguardClient::with_control(wg_config(None), interface.clone()).unwrap();

        let (first, second, third) = tokio::join!(
            client.provision("phone", 0),
            client.provision("laptop", 0),
            client.provision("tablet", 0)
        );
        let (first, second, third) = (first.unwrap(), second.unwrap(), third.unwrap());

        let peers = interface.peers();
        assert_eq!(peers.len(), 4);
        let mut addresses: Vec<String> = peers
            .iter()
            .filter_map(|peer| peer.allowed_ip.clone())
            .collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 4);
        for provisioned in [&first, &second, &third] {
            let peer = peers
                .iter()
                .find(|peer| peer.public_key == provisioned.external_reference)
                .unwrap();
            let ip = peer.allowed_ip.as_deref().unwrap();
            assert!(provisioned.credential_material.contains(&format!("Address = {}", ip)));
        }
    }

    #[tokio::test]
    async fn address_taken_after_set_rolls_back_peer() {
        let mut interface = FakeInterface::with_peers(&[(PEER_A, "10.8.0.2/32")]);
        interface.intruder = Some(PEER_B);
        let interface = Arc::new(interface);
        let client = WireguardClient::with_control(wg_config(None), interface.clone()).unwrap();

        let err = client.provision("laptop", 0).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));

        let peers = interface.peers();
        let keys: Vec<&str> = peers.iter().map(|peer| peer.public_key.as_str()).collect();
        assert_eq!(keys, vec![PEER_A, PEER_B]);
        assert_eq!(peers[1].allowed_ip.as_deref(), Some("10.8.0.3/32"));
    }

    #[tokio::test]
    async fn suspend_swaps_preshared_key_and_resume_restores_it() {
        let interface = Arc::new(FakeInterface::with_peers(&[(PEER_A, "10.8.0.2/32")]));
        let client = WireguardClient::with_control(wg_config(None), interface.clone()).unwrap();
        let provisioned = client.provision("laptop", 0).await.unwrap();
        let issued = preshared_key_from_config(&provisioned.credential_material)
            .unwrap()
            .to_string();
        let key = stored_key(&provisioned.external_reference, provisioned.credential_material);
        let current = || {
            interface
                .peers()
                .into_iter()
                .find(|peer| peer.public_key == key.external_reference)
                .unwrap()
        };

        assert!(client.set_enabled(&key, false).await.unwrap());
        let suspended = current();
        assert_ne!(suspended.preshared_key.as_deref(), Some(issued.as_str()));
        assert_eq!(suspended.allowed_ip.as_deref(), Some("10.8.0.3/32"));

        assert!(client.set_enabled(&key, true).await.unwrap());
        assert_eq!(current().preshared_key.as_deref(), Some(issued.as_str()));
    }

    #[tokio::test]
    async fn suspend_of_absent_peer_reports_false() {
        let interface = Arc::new(FakeInterface::with_peers(&[(PEER_A, "10.8.0.2/32")]));
        let client = WireguardClient::with_control(wg_config(None), interface).unwrap();
        let key = stored_key(PEER_B, String::new());
        assert!(!client.set_enabled(&key, false).await.unwrap());
    }

    #[tokio::test]
    async fn resume_without_issued_key_is_invalid() {
        let interface = Arc::new(FakeInterface::with_peers(&[(PEER_A, "10.8.0.2/32")]));
        let client = WireguardClient::with_control(wg_config(None), interface).unwrap();
        let key = stored_key(PEER_A, "[Interface]\nAddress = 10.8.0.2/32\n".to_string());
        assert!(matches!(
            client.set_enabled(&key, true).await,
            Err(BackendError::InvalidInput(_))
        ));
    }

    #[test]
    fn preshared_key_is_read_from_client_config() {
        let psk = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
        let text = format!("[Peer]\nPublicKey = {SERVER_PUB}\nPresharedKey = {psk}\n");
        assert_eq!(preshared_key_from_config(&text), Some(psk));
        assert_eq!(preshared_key_from_config("PresharedKey = short"), None);
    }

    #[tokio::test]
    async fn provision_respects_peer_limit() {
        let now = unix_now();
        let mut control = MockWgControl::new();
        control
            .expect_wg()
            .withf(|args, _| is_dump_call(args))
            .returning(move |_, _| Ok(dump_text(now)));

        let client = WireguardClient::with_control(wg_config(Some(2)), Arc::new(control)).unwrap();
        let err = client.provision("laptop", 0).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn provision_rejects_bad_name_without_touching_interface() {
        let control = MockWgControl::new();
        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        let err = client.provision("   ", 0).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn deprovision_is_idempotent() {
        let now = unix_now();
        let mut control = MockWgControl::new();
        control
            .expect_wg()
            .withf(|args, _| is_dump_call(args))
            .returning(move |_, _| Ok(dump_text(now)));
        control
            .expect_wg()
            .withf(|args, _| args.last().map(String::as_str) == Some("remove"))
            .times(1)
            .returning(|_, _| Ok(String::new()));

        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        assert!(client.deprovision(PEER_A).await.unwrap());
        let absent = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        assert!(!client.deprovision(absent).await.unwrap());
    }

    #[tokio::test]
    async fn deprovision_rejects_non_key_reference() {
        let control = MockWgControl::new();
        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        let err = client.deprovision("remove").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn usage_for_missing_peer_is_unknown() {
        let now = unix_now();
        let mut control = MockWgControl::new();
        control
            .expect_wg()
            .returning(move |_, _| Ok(dump_text(now)));

        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        let usage = client.get_usage(PEER_A).await.unwrap();
        assert_eq!(usage.bytes_transferred, 3000);
        assert_eq!(usage.backend_status, BackendStatus::Active);

        let missing = client
            .get_usage("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .await
            .unwrap();
        assert_eq!(missing.backend_status, BackendStatus::Unknown);
    }

    #[tokio::test]
    async fn interface_failure_is_unavailable() {
        let mut control = MockWgControl::new();
        control.expect_wg().returning(|_, _| {
            Err(classify_failure("Unable to access interface: No such device"))
        });

        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        assert!(matches!(
            client.get_usage(PEER_A).await,
            Err(BackendError::Unavailable(_))
        ));
        let health = client.health_check().await;
        assert!(!health.is_healthy);
        assert!(health.error_message.is_some());
    }

    #[tokio::test]
    async fn health_reports_tool_version() {
        let mut control = MockWgControl::new();
        control
            .expect_wg()
            .withf(|args, _| args.last().map(String::as_str) == Some("public-key"))
            .returning(|_, _| Ok(format!("{SERVER_PUB}\n")));
        control
            .expect_wg()
            .withf(|args, _| args.len() == 1 && args[0] == "--version")
            .returning(|_, _| {
                Ok("wireguard-tools v1.0.20210914 - https://git.zx2c4.com/wireguard-tools/\n".to_string())
            });

        let client = WireguardClient::with_control(wg_config(None), Arc::new(control)).unwrap();
        let health = client.health_check().await;
        assert!(health.is_healthy);
        assert_eq!(health.version.as_deref(), Some("v1.0.20210914"));
    }
}
