use std::time::Duration;

use anyhow::{anyhow, Result};

/// Worker-side configuration, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub worker_id: String,
    pub log_dir: String,
    pub pool: PoolOptions,
    pub container: ContainerOptions,
    pub limits: LimitsConfig,
    pub session_timeout_minutes: u64,
    pub idle_timeout_minutes: u64,
    pub cleanup_interval_seconds: u64,
    pub default_command_timeout: u64,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Desired warm count after steady state.
    pub target_size: usize,
    /// Lower bound below which refills are urgent.
    pub min_size: usize,
    /// Hard cap on available + allocated.
    pub max_size: usize,
    /// Destroy excess returned containers instead of pooling them.
    pub aggressive_cleanup: bool,
    pub refill_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub image: String,
    pub memory_limit: String,
    pub cpu_quota: i64,
    pub network_mode: String,
    pub sandbox_user: String,
    pub workspace_dir: String,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_file_size_mb: u64,
    pub max_total_files: u64,
    pub max_workspace_size_mb: u64,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Coordinator-side configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub log_dir: String,
    pub workers: Vec<String>,
    pub session_timeout_minutes: u64,
    pub redis: Option<RedisConfig>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn redis_from_env() -> Option<RedisConfig> {
    std::env::var("REDIS_HOST").ok().map(|host| RedisConfig {
        host,
        port: env_parse("REDIS_PORT", 6379),
        password: std::env::var("REDIS_PASSWORD").ok(),
    })
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 7575),
            worker_id: env_string("WORKER_ID", "standalone"),
            log_dir: env_string("LOG_DIR", "/app/logs"),
            pool: PoolOptions {
                target_size: env_parse("POOL_SIZE", 10),
                min_size: env_parse("MIN_POOL_SIZE", 3),
                max_size: env_parse("MAX_POOL_SIZE", 80),
                aggressive_cleanup: env_bool("AGGRESSIVE_CLEANUP", true),
                refill_delay: Duration::from_secs(env_parse("POOL_REFILL_DELAY_SECONDS", 60)),
            },
            container: ContainerOptions {
                image: env_string("CONTAINER_IMAGE", "sandbox-secure:latest"),
                memory_limit: env_string("MEMORY_LIMIT", "256m"),
                cpu_quota: env_parse("CPU_QUOTA", 25000),
                network_mode: env_string("DOCKER_NETWORK_MODE", "none"),
                sandbox_user: env_string("SANDBOX_USER", "sandboxuser"),
                workspace_dir: env_string("WORKSPACE_DIR", "/workspace"),
            },
            limits: LimitsConfig {
                max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 100),
                max_total_files: env_parse("MAX_TOTAL_FILES", 1000),
                max_workspace_size_mb: env_parse("MAX_WORKSPACE_SIZE_MB", 500),
            },
            session_timeout_minutes: env_parse("SESSION_TIMEOUT_MINUTES", 15),
            idle_timeout_minutes: env_parse("CONTAINER_IDLE_TIMEOUT_MINUTES", 5),
            cleanup_interval_seconds: env_parse("CLEANUP_INTERVAL_SECONDS", 300),
            default_command_timeout: env_parse("DEFAULT_COMMAND_TIMEOUT", 30),
            redis: redis_from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.pool.min_size > self.pool.target_size {
            errors.push("MIN_POOL_SIZE cannot be greater than POOL_SIZE".to_string());
        }
        if self.pool.target_size > self.pool.max_size {
            errors.push("POOL_SIZE cannot be greater than MAX_POOL_SIZE".to_string());
        }
        if self.pool.max_size == 0 {
            errors.push("MAX_POOL_SIZE must be >= 1".to_string());
        }
        if self.session_timeout_minutes < 1 {
            errors.push("SESSION_TIMEOUT_MINUTES must be >= 1".to_string());
        }
        if self.idle_timeout_minutes < 1 {
            errors.push("CONTAINER_IDLE_TIMEOUT_MINUTES must be >= 1".to_string());
        }
        if self.cleanup_interval_seconds < 1 {
            errors.push("CLEANUP_INTERVAL_SECONDS must be >= 1".to_string());
        }
        if self.container.cpu_quota < 1000 || self.container.cpu_quota > 100_000 {
            errors.push("CPU_QUOTA must be between 1000 and 100000".to_string());
        }
        if parse_memory_bytes(&self.container.memory_limit).is_err() {
            errors.push(format!(
                "MEMORY_LIMIT '{}' is not a valid size",
                self.container.memory_limit
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            ))
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl ContainerOptions {
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_bytes(&self.memory_limit)
    }
}

impl LimitsConfig {
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn max_workspace_size(&self) -> u64 {
        self.max_workspace_size_mb * 1024 * 1024
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let workers = env_string("WORKERS", "http://localhost:7575")
            .split(',')
            .map(|w| w.trim().trim_end_matches('/').to_string())
            .filter(|w| !w.is_empty())
            .collect();

        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8000),
            log_dir: env_string("LOG_DIR", "/app/logs"),
            workers,
            session_timeout_minutes: env_parse("SESSION_TIMEOUT_MINUTES", 15),
            redis: redis_from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(anyhow!("WORKERS must list at least one worker URL"));
        }
        if self.session_timeout_minutes < 1 {
            return Err(anyhow!("SESSION_TIMEOUT_MINUTES must be >= 1"));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }
}

/// Parse a docker-style memory size ("256m", "2g", "1048576") into bytes.
fn parse_memory_bytes(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty memory size"));
    }

    let (number, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_digit() => (trimmed, 1i64),
        Some('b') | Some('B') => (&trimmed[..trimmed.len() - 1], 1i64),
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => return Err(anyhow!("invalid memory size '{}'", input)),
    };

    let value: i64 = number
        .parse()
        .map_err(|_| anyhow!("invalid memory size '{}'", input))?;
    if value <= 0 {
        return Err(anyhow!("memory size must be positive"));
    }
    Ok(value * multiplier)
}
