//! Configuration: sectioned ini file, environment expansion, typed snapshot.
//!
//! The file is parsed with the `config` crate's INI backend after every
//! `${NAME}` reference has been replaced from the environment; an unresolved
//! reference aborts startup. The raw sections are then folded into a
//! [`RunConfig`], the immutable per-run snapshot that is passed explicitly to
//! every component. There is no process-wide configuration holder.

use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use config::FileFormat;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::manifest::BackupMode;

/// Which destination families a run addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Local,
    Ssh,
    S3,
    Db,
}

impl std::str::FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(OperationMode::Local),
            "ssh" => Ok(OperationMode::Ssh),
            "s3" => Ok(OperationMode::S3),
            "db" => Ok(OperationMode::Db),
            other => Err(format!("unknown operation mode: {other}")),
        }
    }
}

/// Archive compression for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressMode {
    #[default]
    None,
    Zip,
    ZipPw,
}

impl std::str::FromStr for CompressMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(CompressMode::None),
            "zip" => Ok(CompressMode::Zip),
            "zip_pw" => Ok(CompressMode::ZipPw),
            other => Err(format!("unknown compress mode: {other}")),
        }
    }
}

/// One SSH destination host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub remote_dir: PathBuf,
    /// 0 disables the cap.
    pub bandwidth_limit_kbps: u64,
}

impl SshServer {
    pub fn label(&self) -> String {
        format!("ssh://{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub keyfile: Option<PathBuf>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbDumpConfig {
    pub dump_command: String,
    pub dump_args: Vec<String>,
    /// File name of the staged artifact; `<run-id>` is substituted.
    pub artifact_name: String,
    /// Environment variable the password is handed over in, never argv.
    pub password_env: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub max_age_days: u32,
    pub max_count: u32,
}

impl RetentionConfig {
    pub fn is_noop(&self) -> bool {
        self.max_age_days == 0 && self.max_count == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Wall-clock slots, HH:MM.
    pub times: Vec<NaiveTime>,
    /// Tick period and tolerance window, minutes.
    pub interval_minutes: u32,
    pub lock_file: PathBuf,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            times: Vec::new(),
            interval_minutes: 5,
            lock_file: PathBuf::from("/tmp/backup-runner.lock"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    pub pre_backup: Option<String>,
    pub post_backup: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub receivers: Vec<String>,
}

impl NotifyConfig {
    /// An absent receiver list and an empty one both disable notifications.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.receivers.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_addr: String,
}

/// Immutable per-run configuration snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub source_dir: PathBuf,
    pub backup_dirs: Vec<PathBuf>,
    pub operation_modes: Vec<OperationMode>,
    pub backup_mode: BackupMode,
    pub excludes: Vec<String>,
    pub parallel_copies: usize,
    pub compress: CompressMode,
    pub encrypt: bool,
    pub dedup: bool,
    pub ssh_servers: Vec<SshServer>,
    pub s3: Option<S3Config>,
    pub database: Option<DbDumpConfig>,
    pub encryption: EncryptionConfig,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    pub hooks: HooksConfig,
    pub notifications: NotifyConfig,
    pub smtp: Option<SmtpConfig>,
}

impl RunConfig {
    pub fn wants(&self, mode: OperationMode) -> bool {
        self.operation_modes.contains(&mode)
    }

    /// Snapshot for `--show-setup`: secrets masked, never printed.
    pub fn masked(&self) -> RunConfig {
        let mut c = self.clone();
        for server in &mut c.ssh_servers {
            if server.password.is_some() {
                server.password = Some("********".into());
            }
        }
        if let Some(s3) = &mut c.s3 {
            s3.secret_key = "********".into();
        }
        if let Some(db) = &mut c.database {
            db.password = "********".into();
        }
        if c.encryption.passphrase.is_some() {
            c.encryption.passphrase = Some("********".into());
        }
        if let Some(smtp) = &mut c.smtp {
            smtp.password = "********".into();
        }
        c
    }

    /// Replace the SSH server list from `[user@]host[:port]` specs given on
    /// the command line. Credentials and the remote directory come from the
    /// configured servers, which must exist for the specs to be usable.
    pub fn apply_ssh_server_specs(&mut self, specs: &[String]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let template = self.ssh_servers.first().cloned().ok_or_else(|| {
            EngineError::Config(
                "--ssh-servers needs an [SSH] section to supply credentials".into(),
            )
        })?;

        let mut servers = Vec::new();
        for spec in specs {
            let (user_part, host_part) = match spec.split_once('@') {
                Some((user, rest)) => (Some(user.to_string()), rest),
                None => (None, spec.as_str()),
            };
            let (host, port) = match host_part.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse::<u16>()
                        .map_err(|_| EngineError::Config(format!("bad SSH port in {spec:?}")))?,
                ),
                None => (host_part.to_string(), 22),
            };
            if host.is_empty() {
                return Err(EngineError::Config(format!("empty SSH host in {spec:?}")));
            }
            servers.push(SshServer {
                host,
                port,
                username: user_part.unwrap_or_else(|| template.username.clone()),
                ..template.clone()
            });
        }
        self.ssh_servers = servers;
        Ok(())
    }

    /// Load and fold the ini file at `path`.
    pub fn load(path: &Path) -> Result<RunConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let expanded = expand_env_refs(&raw)?;

        let file: FileConfig = config::Config::builder()
            .add_source(config::File::from_str(&expanded, FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;

        file.into_run_config()
    }
}

/// Replace every `${NAME}` with the environment variable `NAME`. Unresolved
/// references are a startup error.
pub fn expand_env_refs(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            return Err(EngineError::Config("unterminated ${...} reference".into()));
        };
        let name = &tail[..end];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                return Err(EngineError::Config(format!(
                    "unresolved environment reference ${{{name}}}"
                )))
            }
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Raw file model. Every value arrives as a string from the ini layer and is
// parsed explicitly; section fields carry aliases for the canonical
// upper-case section names.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default, alias = "DEFAULT")]
    default: DefaultSection,
    #[serde(default, alias = "BACKUPS")]
    backups: BackupsSection,
    #[serde(default, alias = "SSH")]
    ssh: SshSection,
    #[serde(default, alias = "S3")]
    s3: S3Section,
    #[serde(default, alias = "ENCRYPTION")]
    encryption: EncryptionSection,
    #[serde(default, alias = "DATABASE")]
    database: DatabaseSection,
    #[serde(default, alias = "SMTP")]
    smtp: SmtpSection,
    #[serde(default, alias = "DEDUP")]
    dedup: DedupSection,
    #[serde(default, alias = "SCHEDULE")]
    schedule: ScheduleSection,
    #[serde(default, alias = "MODES")]
    modes: ModesSection,
    #[serde(default, alias = "HOOKS")]
    hooks: HooksSection,
    #[serde(default, alias = "RETENTION")]
    retention: RetentionSection,
    #[serde(default, alias = "NOTIFICATIONS")]
    notifications: NotificationsSection,
}

#[derive(Debug, Default, Deserialize)]
struct DefaultSection {
    source_dir: Option<String>,
    parallel_copies: Option<String>,
    exclude: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BackupsSection {
    backup_dirs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SshSection {
    servers: Option<String>,
    username: Option<String>,
    password: Option<String>,
    key_file: Option<String>,
    remote_dir: Option<String>,
    bandwidth_limit_kbps: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct S3Section {
    bucket: Option<String>,
    prefix: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EncryptionSection {
    enabled: Option<String>,
    keyfile: Option<String>,
    passphrase: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseSection {
    enabled: Option<String>,
    dump_command: Option<String>,
    dump_args: Option<String>,
    artifact_name: Option<String>,
    password_env: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SmtpSection {
    host: Option<String>,
    port: Option<String>,
    username: Option<String>,
    password: Option<String>,
    from_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DedupSection {
    enabled: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ScheduleSection {
    times: Option<String>,
    interval_minutes: Option<String>,
    lock_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ModesSection {
    operation_modes: Option<String>,
    backup_mode: Option<String>,
    compress: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HooksSection {
    pre_backup: Option<String>,
    post_backup: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetentionSection {
    max_age_days: Option<String>,
    max_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsSection {
    enabled: Option<String>,
    receiver_emails: Option<String>,
}

fn split_list(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &Option<String>, key: &str) -> Result<bool> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("true") | Some("yes") | Some("1") | Some("on") => Ok(true),
        Some("false") | Some("no") | Some("0") | Some("off") => Ok(false),
        Some(other) => Err(EngineError::Config(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &Option<String>, key: &str, default: T) -> Result<T> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| EngineError::Config(format!("{key}: invalid number {s:?}"))),
    }
}

/// Parse one `[user@]host[:port]` server spec against section-level defaults.
fn parse_ssh_server(spec: &str, section: &SshSection) -> Result<SshServer> {
    let (user_part, host_part) = match spec.split_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, spec),
    };
    let (host, port) = match host_part.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| EngineError::Config(format!("bad SSH port in {spec:?}")))?,
        ),
        None => (host_part.to_string(), 22),
    };
    if host.is_empty() {
        return Err(EngineError::Config(format!("empty SSH host in {spec:?}")));
    }

    let username = user_part
        .or_else(|| section.username.clone())
        .ok_or_else(|| EngineError::Config(format!("no username for SSH server {spec:?}")))?;

    Ok(SshServer {
        host,
        port,
        username,
        password: section.password.clone().filter(|p| !p.is_empty()),
        key_file: section
            .key_file
            .clone()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from),
        remote_dir: PathBuf::from(
            section
                .remote_dir
                .clone()
                .ok_or_else(|| EngineError::Config("ssh.remote_dir is required".into()))?,
        ),
        bandwidth_limit_kbps: parse_number(&section.bandwidth_limit_kbps, "ssh.bandwidth_limit_kbps", 0)?,
    })
}

impl FileConfig {
    fn into_run_config(self) -> Result<RunConfig> {
        let operation_modes = split_list(&self.modes.operation_modes)
            .iter()
            .map(|m| m.parse::<OperationMode>().map_err(EngineError::Config))
            .collect::<Result<Vec<_>>>()?;
        let operation_modes = if operation_modes.is_empty() {
            vec![OperationMode::Local]
        } else {
            operation_modes
        };

        let backup_mode = match self.modes.backup_mode.as_deref().map(str::trim) {
            None | Some("") => BackupMode::Full,
            Some(s) => s.parse().map_err(EngineError::Config)?,
        };
        let compress = match self.modes.compress.as_deref().map(str::trim) {
            None => CompressMode::None,
            Some(s) => s.parse().map_err(EngineError::Config)?,
        };

        let ssh_servers = split_list(&self.ssh.servers)
            .iter()
            .map(|spec| parse_ssh_server(spec, &self.ssh))
            .collect::<Result<Vec<_>>>()?;

        let s3 = match &self.s3.bucket {
            Some(bucket) if !bucket.trim().is_empty() => Some(S3Config {
                bucket: bucket.trim().to_string(),
                prefix: self.s3.prefix.clone().unwrap_or_default(),
                region: self
                    .s3
                    .region
                    .clone()
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: self.s3.endpoint.clone().filter(|e| !e.is_empty()),
                // Environment fallback is part of the config layer contract.
                access_key: self
                    .s3
                    .access_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                    .unwrap_or_default(),
                secret_key: self
                    .s3
                    .secret_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        let database = if parse_bool(&self.database.enabled, "database.enabled")? {
            Some(DbDumpConfig {
                dump_command: self
                    .database
                    .dump_command
                    .clone()
                    .ok_or_else(|| EngineError::Config("database.dump_command is required".into()))?,
                dump_args: split_list(&self.database.dump_args),
                artifact_name: self
                    .database
                    .artifact_name
                    .clone()
                    .unwrap_or_else(|| "db_dump_<run-id>.sql".to_string()),
                password_env: self
                    .database
                    .password_env
                    .clone()
                    .unwrap_or_else(|| "DB_PASSWORD".to_string()),
                password: self.database.password.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        let encryption = EncryptionConfig {
            enabled: parse_bool(&self.encryption.enabled, "encryption.enabled")?,
            keyfile: self
                .encryption
                .keyfile
                .clone()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            passphrase: self.encryption.passphrase.clone().filter(|p| !p.is_empty()),
        };

        let times = split_list(&self.schedule.times)
            .iter()
            .map(|t| {
                NaiveTime::parse_from_str(t, "%H:%M")
                    .map_err(|_| EngineError::Config(format!("schedule time {t:?} is not HH:MM")))
            })
            .collect::<Result<Vec<_>>>()?;
        let schedule = ScheduleConfig {
            times,
            interval_minutes: parse_number(&self.schedule.interval_minutes, "schedule.interval_minutes", 5)?,
            lock_file: self
                .schedule
                .lock_file
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| ScheduleConfig::default().lock_file),
        };

        let smtp = match (&self.smtp.host, &self.smtp.from_addr) {
            (Some(host), Some(from_addr)) if !host.is_empty() => Some(SmtpConfig {
                host: host.clone(),
                port: parse_number(&self.smtp.port, "smtp.port", 587)?,
                username: self.smtp.username.clone().unwrap_or_default(),
                password: self.smtp.password.clone().unwrap_or_default(),
                from_addr: from_addr.clone(),
            }),
            _ => None,
        };

        Ok(RunConfig {
            source_dir: PathBuf::from(
                self.default
                    .source_dir
                    .clone()
                    .ok_or_else(|| EngineError::Config("default.source_dir is required".into()))?,
            ),
            backup_dirs: split_list(&self.backups.backup_dirs)
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            operation_modes,
            backup_mode,
            excludes: split_list(&self.default.exclude),
            parallel_copies: parse_number(&self.default.parallel_copies, "default.parallel_copies", 4)?,
            compress,
            encrypt: encryption.enabled,
            dedup: parse_bool(&self.dedup.enabled, "dedup.enabled")?,
            ssh_servers,
            s3,
            database,
            encryption,
            retention: RetentionConfig {
                max_age_days: parse_number(&self.retention.max_age_days, "retention.max_age_days", 0)?,
                max_count: parse_number(&self.retention.max_count, "retention.max_count", 0)?,
            },
            schedule,
            hooks: HooksConfig {
                pre_backup: self.hooks.pre_backup.clone().filter(|h| !h.is_empty()),
                post_backup: self.hooks.post_backup.clone().filter(|h| !h.is_empty()),
            },
            notifications: NotifyConfig {
                enabled: parse_bool(&self.notifications.enabled, "notifications.enabled")?,
                receivers: split_list(&self.notifications.receiver_emails),
            },
            smtp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_str(ini: &str) -> Result<RunConfig> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ini.as_bytes()).unwrap();
        RunConfig::load(file.path())
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_str(
            "[DEFAULT]\nsource_dir = /data\n\n[BACKUPS]\nbackup_dirs = /mnt/a, /mnt/b\n",
        )
        .unwrap();

        assert_eq!(cfg.source_dir, PathBuf::from("/data"));
        assert_eq!(cfg.backup_dirs.len(), 2);
        assert_eq!(cfg.operation_modes, vec![OperationMode::Local]);
        assert_eq!(cfg.backup_mode, BackupMode::Full);
        assert_eq!(cfg.parallel_copies, 4);
        assert_eq!(cfg.compress, CompressMode::None);
        assert!(cfg.retention.is_noop());
        assert!(!cfg.notifications.is_active());
    }

    #[test]
    fn missing_source_dir_is_a_config_error() {
        let err = load_str("[BACKUPS]\nbackup_dirs = /mnt/a\n");
        assert!(matches!(err, Err(EngineError::Config(_))));
    }

    #[test]
    fn env_refs_are_expanded() {
        std::env::set_var("BACKUP_TEST_SRC", "/from-env");
        let cfg = load_str("[DEFAULT]\nsource_dir = ${BACKUP_TEST_SRC}\n").unwrap();
        assert_eq!(cfg.source_dir, PathBuf::from("/from-env"));
    }

    #[test]
    fn unresolved_env_ref_aborts() {
        let err = expand_env_refs("x = ${DEFINITELY_NOT_SET_ANYWHERE_42}");
        assert!(matches!(err, Err(EngineError::Config(_))));
    }

    #[test]
    fn ssh_server_specs_parse() {
        let section = SshSection {
            servers: None,
            username: Some("backup".into()),
            password: None,
            key_file: None,
            remote_dir: Some("/srv/backups".into()),
            bandwidth_limit_kbps: None,
        };

        let s = parse_ssh_server("host1.example.com", &section).unwrap();
        assert_eq!(s.host, "host1.example.com");
        assert_eq!(s.port, 22);
        assert_eq!(s.username, "backup");

        let s = parse_ssh_server("alice@host2:2222", &section).unwrap();
        assert_eq!(s.username, "alice");
        assert_eq!(s.port, 2222);

        assert!(parse_ssh_server("bad:port:spec:x", &section).is_err());
    }

    #[test]
    fn schedule_times_parse_and_reject_garbage() {
        let cfg = load_str(
            "[DEFAULT]\nsource_dir = /data\n\n[SCHEDULE]\ntimes = 02:30, 14:00\ninterval_minutes = 10\n",
        )
        .unwrap();
        assert_eq!(cfg.schedule.times.len(), 2);
        assert_eq!(cfg.schedule.interval_minutes, 10);

        let err = load_str("[DEFAULT]\nsource_dir = /d\n\n[SCHEDULE]\ntimes = 25:99\n");
        assert!(err.is_err());
    }

    #[test]
    fn masked_snapshot_hides_secrets() {
        let cfg = load_str(
            "[DEFAULT]\nsource_dir = /data\n\n[ENCRYPTION]\nenabled = true\npassphrase = hunter2\n",
        )
        .unwrap();
        let masked = cfg.masked();
        assert_eq!(masked.encryption.passphrase.as_deref(), Some("********"));
        let json = serde_json::to_string(&masked).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
