use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8317;
const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_MAX_RETRY_WAIT_MS: u64 = 2_000;
const DEFAULT_USER_AGENT: &str = "any2api/0.3";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_user_agent: String,
    pub timeout_ms: u64,
    pub proxy: String,

    /// 入站鉴权 API Key；为空时不校验。
    pub api_key: String,

    /// 一次请求失败后，额外的完整重试轮数。
    pub retry_count: u32,
    /// 轮间等待的上限（毫秒）；最近的冷却恢复点超过该值则不再等待。
    pub max_retry_wait_ms: u64,
    /// 选择策略：round-robin 或 fill-first。
    pub select_strategy: String,

    pub debug: String,

    pub data_dir: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_USER_AGENT")]
    api_user_agent: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,

    #[serde(alias = "RETRY_COUNT")]
    retry_count: Option<u32>,
    #[serde(alias = "MAX_RETRY_WAIT_MS")]
    max_retry_wait_ms: Option<u64>,
    #[serde(alias = "SELECT_STRATEGY")]
    select_strategy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_user_agent: raw
                .api_user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            api_key: raw.api_key.unwrap_or_default(),
            retry_count: raw.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            max_retry_wait_ms: raw.max_retry_wait_ms.unwrap_or(DEFAULT_MAX_RETRY_WAIT_MS),
            select_strategy: raw
                .select_strategy
                .unwrap_or_else(|| "round-robin".to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn client_log_enabled(&self) -> bool {
        self.log_level().client_enabled()
    }

    pub fn backend_log_enabled(&self) -> bool {
        self.log_level().backend_enabled()
    }
}

/// 默认数据目录：OS 约定的配置目录下的 any2api 子目录；取不到时退化为 ./data。
fn default_data_dir() -> String {
    directories::BaseDirs::new()
        .map(|d| d.config_dir().join("any2api"))
        .and_then(|p| p.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "./data".to_string())
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotenv_line_handles_quotes_and_comments() {
        assert_eq!(
            parse_dotenv_line("API_KEY=abc123"),
            Some(("API_KEY".to_string(), "abc123".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("export PORT=\"8317\""),
            Some(("PORT".to_string(), "8317".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("DEBUG=low # 注释"),
            Some(("DEBUG".to_string(), "low".to_string()))
        );
        assert_eq!(parse_dotenv_line("# 整行注释"), None);
        assert_eq!(parse_dotenv_line("=no-key"), None);
    }
}
