//! Compose file parser
//!
//! Turns a compose YAML document into a validated [`Project`].

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, EnvironmentConfig, HealthProbeConfig,
    HealthcheckConfig, HealthcheckTest, PortConfig, ProbeTargetConfig, Scalar, ServiceConfig,
};
use crate::error::{Result, StagehandError};
use crate::service::{
    HealthProbeSpec, LaunchSource, PortMapping, ProbeCheck, ProbeKind, Project, Protocol,
    RestartPolicy, ServiceSpec,
};
use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Load, interpolate and validate a compose file
    pub fn load(path: &Path, vars: &IndexMap<String, String>) -> Result<Project> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StagehandError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let base_dir = base_dir_of(path);
        let config = Self::parse_str(&interpolate(&content, vars))?;
        Self::to_project(&config, &base_dir, &directory_name(&base_dir))
    }

    /// Project name for a compose file, without validating its services.
    ///
    /// Reads only the top-level `name` key and falls back to the directory
    /// name when the file is missing or is not a YAML mapping.
    pub fn project_name_of(path: &Path, vars: &IndexMap<String, String>) -> String {
        let declared = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| {
                serde_yaml::from_str::<serde_yaml::Value>(&interpolate(&content, vars)).ok()
            })
            .and_then(|doc| doc.get("name").and_then(|n| n.as_str()).map(str::to_string));

        match declared {
            Some(name) => project_name(&name),
            None => project_name(&directory_name(&base_dir_of(path))),
        }
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| StagehandError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Convert a parsed compose document into a validated project.
    ///
    /// Relative build contexts resolve against `base_dir`.
    pub fn to_project(config: &ComposeConfig, base_dir: &Path, default_name: &str) -> Result<Project> {
        let name = project_name(config.name.as_deref().unwrap_or(default_name));

        let services = config
            .services
            .iter()
            .map(|(name, service)| Self::to_service_spec(name, service, base_dir))
            .collect::<Result<Vec<_>>>()?;

        Project::new(&name, services)
    }

    fn to_service_spec(name: &str, service: &ServiceConfig, base_dir: &Path) -> Result<ServiceSpec> {
        let launch = match (&service.build, &service.image) {
            (Some(build), image) => {
                let (context, dockerfile) = match build {
                    BuildConfig::Simple(path) => (path.clone(), None),
                    BuildConfig::Full(full) => (
                        full.context.clone().unwrap_or_else(|| ".".to_string()),
                        full.dockerfile.clone(),
                    ),
                };
                LaunchSource::Build {
                    context: base_dir.join(context),
                    dockerfile,
                    tag: image.clone(),
                }
            }
            (None, Some(image)) => LaunchSource::Image(image.clone()),
            (None, None) => return Err(StagehandError::MissingLaunchSource(name.to_string())),
        };

        let mut spec = ServiceSpec::new(name, launch);

        if let Some(ref cmd) = service.command {
            spec.command = match cmd {
                CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
                CommandConfig::Exec(arr) => arr.clone(),
            };
        }

        spec.working_dir = service.working_dir.as_ref().map(PathBuf::from);

        if let Some(ref env) = service.environment {
            match env {
                EnvironmentConfig::Array(arr) => {
                    for item in arr {
                        match item.split_once('=') {
                            Some((key, value)) => {
                                spec.environment.insert(key.to_string(), value.to_string());
                            }
                            None => tracing::warn!(
                                "Service '{}': ignoring environment entry '{}' without a value",
                                name,
                                item
                            ),
                        }
                    }
                }
                EnvironmentConfig::Map(map) => {
                    for (key, value) in map {
                        if let Some(v) = value {
                            spec.environment.insert(key.clone(), v.to_string());
                        }
                    }
                }
            }
        }

        if let Some(ref ports) = service.ports {
            for port in ports {
                spec.ports.push(parse_port_config(name, port)?);
            }
        }

        if let Some(ref depends) = service.depends_on {
            spec.depends_on = depends.names();
        }

        spec.health_probe = match (&service.health_probe, &service.healthcheck) {
            (Some(probe), _) => Some(parse_health_probe(name, probe, &spec)?),
            (None, Some(check)) => parse_healthcheck(name, check)?,
            (None, None) => None,
        };

        let restart = service
            .restart_policy
            .clone()
            .or_else(|| service.restart.clone())
            .or_else(|| {
                service
                    .deploy
                    .as_ref()
                    .and_then(|d| d.restart_policy.as_ref())
                    .and_then(|r| r.condition.clone())
            });
        if let Some(restart) = restart {
            spec.restart_policy = restart
                .parse::<RestartPolicy>()
                .map_err(|e| invalid(name, &e))?;
        }

        if let Some(ref grace) = service.stop_grace_period {
            spec.stop_grace_period = scalar_duration(name, grace)?;
        }

        Ok(spec)
    }
}

fn base_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn directory_name(dir: &Path) -> String {
    dir.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string())
}

fn invalid(service: &str, message: &str) -> StagehandError {
    StagehandError::InvalidConfig(format!("Service '{}': {}", service, message))
}

/// Normalize a project name to lowercase letters, digits, `-` and `_`
fn project_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ms|us|s|m|h)").expect("duration pattern is valid")
    })
}

fn seconds(value: f64, raw: &str) -> std::result::Result<Duration, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration '{}'", raw));
    }
    Duration::try_from_secs_f64(value).map_err(|_| format!("duration '{}' is out of range", raw))
}

/// Parse a compose duration: `500ms`, `5s`, `1m30s`, `2h`, or bare seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds(secs, s);
    }

    let re = duration_regex();
    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        consumed += whole.len();
        let value: f64 = caps[1].parse().map_err(|_| format!("invalid duration '{}'", s))?;
        let part = match &caps[2] {
            "us" => seconds(value / 1_000_000.0, s)?,
            "ms" => seconds(value / 1000.0, s)?,
            "s" => seconds(value, s)?,
            "m" => seconds(value * 60.0, s)?,
            _ => seconds(value * 3600.0, s)?,
        };
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration '{}' is out of range", s))?;
    }

    if consumed != s.len() {
        return Err(format!("invalid duration '{}'", s));
    }
    Ok(total)
}

fn scalar_duration(service: &str, value: &Scalar) -> Result<Duration> {
    match value {
        Scalar::Integer(secs) if *secs >= 0 => Ok(Duration::from_secs(*secs as u64)),
        Scalar::Float(secs) => seconds(*secs, &secs.to_string()).map_err(|e| invalid(service, &e)),
        Scalar::Text(s) => parse_duration(s).map_err(|e| invalid(service, &e)),
        other => Err(invalid(service, &format!("invalid duration '{}'", other))),
    }
}

fn optional_duration(service: &str, value: &Option<Scalar>, default: Duration) -> Result<Duration> {
    match value {
        Some(v) => scalar_duration(service, v),
        None => Ok(default),
    }
}

/// Parse short port syntax: `C`, `H:C`, `IP:H:C`, each with an optional `/proto`
pub fn parse_port(s: &str) -> std::result::Result<PortMapping, String> {
    let (spec, protocol) = match s.rsplit_once('/') {
        Some((spec, "tcp")) => (spec, Protocol::Tcp),
        Some((spec, "udp")) => (spec, Protocol::Udp),
        Some((_, other)) => return Err(format!("unsupported protocol '{}'", other)),
        None => (s, Protocol::Tcp),
    };

    let number = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}' in '{}'", p, s))
    };

    let parts: Vec<&str> = spec.split(':').collect();
    let (host_ip, host_port, container_port) = match parts.as_slice() {
        [container] => (None, None, number(container)?),
        [host, container] => (None, Some(number(host)?), number(container)?),
        [ip, host, container] => {
            let host_port = if host.is_empty() { None } else { Some(number(host)?) };
            (Some(ip.to_string()), host_port, number(container)?)
        }
        _ => return Err(format!("invalid port mapping '{}'", s)),
    };

    Ok(PortMapping {
        host_ip,
        host_port,
        container_port,
        protocol,
    })
}

fn parse_port_config(service: &str, port: &PortConfig) -> Result<PortMapping> {
    match port {
        PortConfig::Number(container) => Ok(PortMapping {
            host_ip: None,
            host_port: None,
            container_port: *container,
            protocol: Protocol::Tcp,
        }),
        PortConfig::Short(s) => parse_port(s).map_err(|e| invalid(service, &e)),
        PortConfig::Long(long) => {
            let host_port = match &long.published {
                None => None,
                Some(p) => Some(
                    p.to_string()
                        .parse::<u16>()
                        .map_err(|_| invalid(service, &format!("invalid published port '{}'", p)))?,
                ),
            };
            let protocol = match long.protocol.as_deref() {
                None | Some("tcp") => Protocol::Tcp,
                Some("udp") => Protocol::Udp,
                Some(other) => {
                    return Err(invalid(service, &format!("unsupported protocol '{}'", other)))
                }
            };
            Ok(PortMapping {
                host_ip: long.host_ip.clone(),
                host_port,
                container_port: long.target,
                protocol,
            })
        }
    }
}

/// Split `host:port` or `port`; an empty string means "no explicit port"
fn parse_authority(service: &str, authority: &str) -> Result<(Option<String>, Option<u16>)> {
    if authority.is_empty() {
        return Ok((None, None));
    }
    let port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| invalid(service, &format!("invalid probe port '{}'", p)))
    };
    match authority.rsplit_once(':') {
        Some((host, p)) => Ok((Some(host.to_string()), Some(port(p)?))),
        None if authority.chars().all(|c| c.is_ascii_digit()) => Ok((None, Some(port(authority)?))),
        None => Ok((Some(authority.to_string()), None)),
    }
}

fn parse_health_probe(
    service: &str,
    probe: &HealthProbeConfig,
    spec: &ServiceSpec,
) -> Result<HealthProbeSpec> {
    let kind: ProbeKind = probe.kind.parse().map_err(|e: String| invalid(service, &e))?;
    let default_port = spec.first_host_port();
    let missing_port = || {
        invalid(
            service,
            &format!("{} probe needs a target port or a published port", kind),
        )
    };

    let check = match (kind, &probe.target) {
        (ProbeKind::TcpConnect, None) => ProbeCheck::TcpConnect {
            host: None,
            port: default_port.ok_or_else(missing_port)?,
        },
        (ProbeKind::TcpConnect, Some(ProbeTargetConfig::Value(v))) => {
            let (host, port) = parse_authority(service, &v.to_string())?;
            ProbeCheck::TcpConnect {
                host,
                port: port.or(default_port).ok_or_else(missing_port)?,
            }
        }
        (ProbeKind::HttpGet, target) => {
            let raw = match target {
                None => String::new(),
                Some(ProbeTargetConfig::Value(v)) => v.to_string(),
                Some(ProbeTargetConfig::Args(_)) => {
                    return Err(invalid(service, "http-get probe target must be a URL or path"))
                }
            };
            if raw.starts_with("https://") {
                return Err(invalid(service, "http-get probes only support plain http"));
            }
            let raw = raw.strip_prefix("http://").unwrap_or(&raw);
            let (authority, path) = match raw.find('/') {
                Some(i) => (&raw[..i], raw[i..].to_string()),
                None => (raw, "/".to_string()),
            };
            let (host, port) = parse_authority(service, authority)?;
            let port = match (&host, port) {
                (_, Some(p)) => p,
                (Some(_), None) => 80,
                (None, None) => default_port.ok_or_else(missing_port)?,
            };
            ProbeCheck::HttpGet { host, port, path }
        }
        (ProbeKind::Command, Some(ProbeTargetConfig::Args(argv))) if !argv.is_empty() => {
            ProbeCheck::Command { argv: argv.clone() }
        }
        (ProbeKind::Command, Some(ProbeTargetConfig::Value(Scalar::Text(cmd)))) => ProbeCheck::Command {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()],
        },
        (ProbeKind::Command, _) | (ProbeKind::TcpConnect, Some(ProbeTargetConfig::Args(_))) => {
            return Err(invalid(service, &format!("invalid {} probe target", kind)))
        }
    };

    Ok(HealthProbeSpec {
        check,
        interval: optional_duration(service, &probe.interval, HealthProbeSpec::DEFAULT_INTERVAL)?,
        timeout: optional_duration(service, &probe.timeout, HealthProbeSpec::DEFAULT_TIMEOUT)?,
        retries: probe.retries.unwrap_or(HealthProbeSpec::DEFAULT_RETRIES),
        start_period: optional_duration(service, &probe.start_period, Duration::ZERO)?,
    })
}

/// Map a compose `healthcheck` onto a command probe
fn parse_healthcheck(service: &str, check: &HealthcheckConfig) -> Result<Option<HealthProbeSpec>> {
    if check.disable == Some(true) {
        return Ok(None);
    }

    let argv = match &check.test {
        None => return Ok(None),
        Some(HealthcheckTest::Command(cmd)) => {
            vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()]
        }
        Some(HealthcheckTest::Array(arr)) => match arr.split_first() {
            Some((first, _)) if first == "NONE" => return Ok(None),
            Some((first, rest)) if first == "CMD" && !rest.is_empty() => rest.to_vec(),
            Some((first, rest)) if first == "CMD-SHELL" && !rest.is_empty() => {
                vec!["/bin/sh".to_string(), "-c".to_string(), rest.join(" ")]
            }
            _ => return Err(invalid(service, "invalid healthcheck test")),
        },
    };

    Ok(Some(HealthProbeSpec {
        check: ProbeCheck::Command { argv },
        interval: optional_duration(service, &check.interval, HealthProbeSpec::DEFAULT_INTERVAL)?,
        timeout: optional_duration(service, &check.timeout, HealthProbeSpec::DEFAULT_TIMEOUT)?,
        retries: check.retries.unwrap_or(HealthProbeSpec::DEFAULT_RETRIES),
        start_period: optional_duration(service, &check.start_period, Duration::ZERO)?,
    }))
}

fn interpolation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("interpolation pattern is valid")
    })
}

/// Interpolate `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`.
///
/// Only `vars` are consulted, never the host environment. `$$` is a literal `$`.
pub fn interpolate(s: &str, vars: &IndexMap<String, String>) -> String {
    interpolation_regex()
        .replace_all(s, |caps: &regex::Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }
            let (var, op, default) = match caps.get(1) {
                Some(braced) => (
                    braced.as_str(),
                    caps.get(2).map(|m| m.as_str()),
                    caps.get(3).map(|m| m.as_str()).unwrap_or_default(),
                ),
                None => (caps.get(4).map(|m| m.as_str()).unwrap_or_default(), None, ""),
            };
            match (vars.get(var), op) {
                (Some(value), Some(":-")) if value.is_empty() => default.to_string(),
                (Some(value), _) => value.clone(),
                (None, Some(_)) => default.to_string(),
                (None, None) => {
                    tracing::warn!("Variable '{}' is not set, substituting an empty string", var);
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Parse a `KEY=value` env file; blank lines and `#` comments are skipped
pub fn parse_env_file(content: &str) -> IndexMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_WITH_DATABASE: &str = r#"
version: "3.8"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    environment:
      - DB_HOST=db
    depends_on:
      - db
  db:
    image: mysql:8
    ports:
      - "3307:3306"
    environment:
      MYSQL_ROOT_PASSWORD: secret
      MYSQL_DATABASE: fastapi
    volumes:
      - db_data:/var/lib/mysql
volumes:
  db_data:
"#;

    fn project(yaml: &str) -> Result<Project> {
        let config = ComposeParser::parse_str(yaml)?;
        ComposeParser::to_project(&config, Path::new("/srv/app"), "app")
    }

    #[test]
    fn test_parse_app_with_database() {
        let project = project(APP_WITH_DATABASE).unwrap();

        assert_eq!(project.name(), "app");
        assert_eq!(project.start_order_names(), vec!["db", "app"]);

        let app = project.get("app").unwrap();
        assert_eq!(
            app.launch,
            LaunchSource::Build {
                context: PathBuf::from("/srv/app/."),
                dockerfile: None,
                tag: None,
            }
        );
        assert_eq!(app.environment.get("DB_HOST").map(String::as_str), Some("db"));
        assert!(app.health_probe.is_none());

        let db = project.get("db").unwrap();
        assert_eq!(db.launch, LaunchSource::Image("mysql:8".to_string()));
        assert_eq!(db.ports, vec![PortMapping::published(3307, 3306)]);
        assert_eq!(db.restart_policy, RestartPolicy::Never);
    }

    #[test]
    fn test_health_probe_extension() {
        let yaml = r#"
services:
  db:
    image: mysql
    ports: ["3307:3306"]
    restart: on-failure
    stop_grace_period: 1m30s
    health_probe:
      kind: tcp-connect
      target: 3307
      interval: 500ms
      timeout: 5s
      retries: 3
  web:
    image: app
    ports:
      - target: 8000
        published: "8080"
    depends_on:
      db:
        condition: service_healthy
    health_probe:
      kind: http-get
      target: /health
"#;
        let project = project(yaml).unwrap();

        let db = project.get("db").unwrap();
        let probe = db.health_probe.as_ref().unwrap();
        assert_eq!(probe.check, ProbeCheck::TcpConnect { host: None, port: 3307 });
        assert_eq!(probe.interval, Duration::from_millis(500));
        assert_eq!(probe.timeout, Duration::from_secs(5));
        assert_eq!(probe.retries, 3);
        assert_eq!(db.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(db.stop_grace_period, Duration::from_secs(90));

        let web = project.get("web").unwrap();
        assert_eq!(web.depends_on, vec!["db"]);
        assert_eq!(
            web.health_probe.as_ref().unwrap().check,
            ProbeCheck::HttpGet {
                host: None,
                port: 8080,
                path: "/health".to_string(),
            }
        );
    }

    #[test]
    fn test_compose_healthcheck_maps_to_command_probe() {
        let yaml = r#"
services:
  db:
    image: mysql
    healthcheck:
      test: ["CMD", "mysqladmin", "ping", "-h", "localhost"]
      interval: 10s
      retries: 5
  cache:
    image: redis
    healthcheck:
      test: ["CMD-SHELL", "redis-cli ping | grep PONG"]
  off:
    image: busybox
    healthcheck:
      disable: true
"#;
        let project = project(yaml).unwrap();

        let db = project.get("db").unwrap().health_probe.clone().unwrap();
        assert_eq!(db.kind(), ProbeKind::Command);
        assert_eq!(
            db.check,
            ProbeCheck::Command {
                argv: vec!["mysqladmin", "ping", "-h", "localhost"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            }
        );
        assert_eq!(db.interval, Duration::from_secs(10));
        assert_eq!(db.retries, 5);

        let cache = project.get("cache").unwrap().health_probe.clone().unwrap();
        assert_eq!(
            cache.check,
            ProbeCheck::Command {
                argv: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "redis-cli ping | grep PONG".to_string()
                ],
            }
        );

        assert!(project.get("off").unwrap().health_probe.is_none());
    }

    #[test]
    fn test_validate_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;
        assert!(matches!(
            project(yaml),
            Err(StagehandError::MissingLaunchSource(ref name)) if name == "web"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = r#"
services:
  web:
    image: app
    depends_on: [database]
"#;
        let err = project(yaml).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_duplicate_host_port_rejected() {
        let yaml = r#"
services:
  a:
    image: nginx
    ports: ["8080:80"]
  b:
    image: nginx
    ports: ["127.0.0.1:8080:8080"]
"#;
        assert!(matches!(
            project(yaml),
            Err(StagehandError::DuplicateHostPort { port: 8080, .. })
        ));
    }

    #[test]
    fn test_probe_without_port_rejected() {
        let yaml = r#"
services:
  db:
    image: mysql
    health_probe:
      kind: tcp-connect
"#;
        assert!(matches!(project(yaml), Err(StagehandError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("3307:3306").unwrap(), PortMapping::published(3307, 3306));

        let bare = parse_port("80").unwrap();
        assert_eq!(bare.host_port, None);
        assert_eq!(bare.container_port, 80);

        let full = parse_port("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(full.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(full.host_port, Some(5353));
        assert_eq!(full.protocol, Protocol::Udp);

        assert!(parse_port("8000-8010:8000-8010").is_err());
        assert!(parse_port("80/sctp").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5s later").is_err());
    }

    #[test]
    fn test_project_name_of_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yaml");
        std::fs::write(
            &path,
            "name: Shop\nservices:\n  a:\n    image: x\n    depends_on: [a]\n",
        )
        .unwrap();

        assert!(ComposeParser::load(&path, &IndexMap::new()).is_err());
        assert_eq!(ComposeParser::project_name_of(&path, &IndexMap::new()), "shop");
    }

    #[test]
    fn test_project_name_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("My App");
        std::fs::create_dir(&project_dir).unwrap();

        let name = ComposeParser::project_name_of(&project_dir.join("compose.yaml"), &IndexMap::new());
        assert_eq!(name, "myapp");
    }

    #[test]
    fn test_parse_duration_rejects_out_of_range() {
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("inf").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("99999999999999999999999h").is_err());
        assert!(parse_duration("1e300").is_err());
    }

    #[test]
    fn test_negative_grace_period_is_config_error() {
        let yaml = r#"
services:
  db:
    image: mysql
    stop_grace_period: "-5"
"#;
        assert!(matches!(project(yaml), Err(StagehandError::InvalidConfig(_))));

        let yaml = r#"
services:
  db:
    image: mysql
    stop_grace_period: .inf
"#;
        assert!(matches!(project(yaml), Err(StagehandError::InvalidConfig(_))));
    }

    #[test]
    fn test_interpolate() {
        let mut vars = IndexMap::new();
        vars.insert("TAG".to_string(), "1.0.0".to_string());
        vars.insert("EMPTY".to_string(), String::new());

        assert_eq!(interpolate("nginx:${TAG}", &vars), "nginx:1.0.0");
        assert_eq!(interpolate("nginx:$TAG", &vars), "nginx:1.0.0");
        assert_eq!(interpolate("${MISSING:-latest}", &vars), "latest");
        assert_eq!(interpolate("${EMPTY:-fallback}", &vars), "fallback");
        assert_eq!(interpolate("${EMPTY-fallback}", &vars), "");
        assert_eq!(interpolate("cost: $$5", &vars), "cost: $5");
    }

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# database\nDB_USER=root\nexport DB_PASSWORD=\"s3cret\"\n\nDB_PORT='3307'\n",
        );
        assert_eq!(vars.get("DB_USER").map(String::as_str), Some("root"));
        assert_eq!(vars.get("DB_PASSWORD").map(String::as_str), Some("s3cret"));
        assert_eq!(vars.get("DB_PORT").map(String::as_str), Some("3307"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yaml");
        std::fs::write(
            &path,
            "name: Demo\nservices:\n  db:\n    image: mysql:${MYSQL_TAG:-8}\n",
        )
        .unwrap();

        assert_eq!(ComposeParser::find_compose_file(dir.path()), Some(path.clone()));

        let project = ComposeParser::load(&path, &IndexMap::new()).unwrap();
        assert_eq!(project.name(), "demo");
        assert_eq!(
            project.get("db").unwrap().launch,
            LaunchSource::Image("mysql:8".to_string())
        );
    }
}
