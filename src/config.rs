//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__EXECUTION__TOOL_TIMEOUT_MS=500`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub execution: ExecutionSection,
    pub router: RouterSection,
    pub shutdown: ShutdownSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [execution] 段：工具调用与 Execution 的超时、重试、回收
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// 单次工具调用超时（毫秒）
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// 整个 Execution 的默认时限（毫秒）
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// 工具调用超时是否收紧到 Execution 剩余时间
    #[serde(default = "default_clamp_tool_timeout")]
    pub clamp_tool_timeout: bool,
    /// 工具失败后的最大重试次数（0 表示不重试）
    #[serde(default)]
    pub tool_max_retries: u32,
    /// 终态 Execution 保留时长（秒），超过后可被回收
    #[serde(default = "default_reap_after_secs")]
    pub reap_after_secs: u64,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_execution_timeout_ms() -> u64 {
    120_000
}

fn default_clamp_tool_timeout() -> bool {
    true
}

fn default_reap_after_secs() -> u64 {
    3600
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            clamp_tool_timeout: default_clamp_tool_timeout(),
            tool_max_retries: 0,
            reap_after_secs: default_reap_after_secs(),
        }
    }
}

impl ExecutionSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn reap_after(&self) -> Duration {
        Duration::from_secs(self.reap_after_secs)
    }
}

/// [router] 段：直连模式使用的工具名与超时
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_lookup_tool")]
    pub lookup_tool: String,
    #[serde(default = "default_insert_tool")]
    pub insert_tool: String,
    #[serde(default = "default_search_tool")]
    pub search_tool: String,
    /// 直连调用超时（毫秒）
    #[serde(default = "default_direct_timeout_ms")]
    pub direct_timeout_ms: u64,
}

fn default_lookup_tool() -> String {
    "lookup".to_string()
}

fn default_insert_tool() -> String {
    "insert".to_string()
}

fn default_search_tool() -> String {
    "search".to_string()
}

fn default_direct_timeout_ms() -> u64 {
    10_000
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            lookup_tool: default_lookup_tool(),
            insert_tool: default_insert_tool(),
            search_tool: default_search_tool(),
            direct_timeout_ms: default_direct_timeout_ms(),
        }
    }
}

/// [shutdown] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,
}

fn default_cleanup_timeout_secs() -> u64 {
    5
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.execution.tool_timeout_ms, 30_000);
        assert_eq!(cfg.execution.execution_timeout_ms, 120_000);
        assert!(cfg.execution.clamp_tool_timeout);
        assert_eq!(cfg.execution.tool_max_retries, 0);
        assert_eq!(cfg.router.search_tool, "search");
        assert_eq!(cfg.shutdown.cleanup_timeout_secs, 5);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[execution]\ntool_timeout_ms = 250\ntool_max_retries = 2\n\n[router]\nsearch_tool = \"web_search\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.execution.tool_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.execution.tool_max_retries, 2);
        // 未出现的键保持默认值
        assert_eq!(cfg.execution.execution_timeout_ms, 120_000);
        assert_eq!(cfg.router.search_tool, "web_search");
        assert_eq!(cfg.router.lookup_tool, "lookup");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/hive.toml"))).unwrap();
        assert_eq!(cfg.router.insert_tool, "insert");
        assert_eq!(cfg.execution.reap_after(), Duration::from_secs(3600));
    }
}
